//! Pipeline layouts.
//!
//! Declared binding by binding, then frozen in two steps: `build_layout`
//! creates the descriptor set layouts (enough to allocate `Set`s) and `build`
//! the pipeline layout itself. Pipelines refuse a layout that isn't built,
//! and declarations after `build_layout` are ignored with a warning.

use std::collections::BTreeMap;

use ash::vk;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutState {
    #[default]
    Declaring,
    SetsBuilt,
    Built,
}

/// Device-independent part: what was declared and how far it got.
#[derive(Debug, Clone, Default)]
pub struct LayoutDesc {
    name: String,
    sets: BTreeMap<u32, BTreeMap<u32, LayoutBinding>>,
    push_constants: Vec<vk::PushConstantRange>,
    state: LayoutState,
}

impl LayoutDesc {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn state(&self) -> LayoutState {
        self.state
    }

    fn frozen(&self, what: &str) -> bool {
        if self.state != LayoutState::Declaring {
            log::warn!("{}: {} after build ignored", self.name, what);
            return true;
        }
        false
    }

    /// Declare a binding. Returns false when the layout is already frozen.
    pub fn add_binding(&mut self, set: u32, binding: LayoutBinding) -> bool {
        if self.frozen("binding declaration") {
            return false;
        }
        let bindings = self.sets.entry(set).or_default();
        if bindings.insert(binding.binding, binding).is_some() {
            log::warn!("{}: set {} binding {} declared twice", self.name, set, binding.binding);
        }
        true
    }

    pub fn add_push_constant(&mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> bool {
        if self.frozen("push constant declaration") {
            return false;
        }
        self.push_constants.push(vk::PushConstantRange { stage_flags: stages, offset, size });
        true
    }

    /// Number of set layouts; gaps in the set numbering get empty layouts.
    pub fn set_count(&self) -> u32 {
        self.sets.keys().next_back().map_or(0, |&last| last + 1)
    }

    pub fn bindings(&self, set: u32) -> Vec<LayoutBinding> {
        self.sets.get(&set).map(|b| b.values().copied().collect()).unwrap_or_default()
    }

    pub fn binding(&self, set: u32, binding: u32) -> Option<LayoutBinding> {
        self.sets.get(&set).and_then(|b| b.get(&binding)).copied()
    }

    pub fn push_constants(&self) -> &[vk::PushConstantRange] {
        &self.push_constants
    }

    /// Bindings of `set` that take a dynamic offset, in binding order.
    pub fn dynamic_bindings(&self, set: u32) -> Vec<u32> {
        self.bindings(set)
            .into_iter()
            .filter(|b| {
                matches!(
                    b.ty,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                )
            })
            .map(|b| b.binding)
            .collect()
    }

    fn advance(&mut self, to: LayoutState) {
        self.state = to;
    }
}

pub struct PipelineLayout {
    desc: LayoutDesc,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    handle: vk::PipelineLayout,
    device: ash::Device,
}

impl PipelineLayout {
    pub fn new(device: &ash::Device, name: &str) -> Self {
        Self {
            desc: LayoutDesc::new(name),
            set_layouts: Vec::new(),
            handle: vk::PipelineLayout::null(),
            device: device.clone(),
        }
    }

    pub fn desc(&self) -> &LayoutDesc {
        &self.desc
    }

    fn declare(&mut self, set: u32, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> &mut Self {
        self.desc.add_binding(set, LayoutBinding { binding, ty, count: 1, stages });
        self
    }

    /// Plain uniform block, or a dynamic one for virtual uniforms.
    pub fn set_uniform_location(
        &mut self,
        set: u32,
        binding: u32,
        stages: vk::ShaderStageFlags,
        dynamic: bool,
    ) -> &mut Self {
        let ty = if dynamic {
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        } else {
            vk::DescriptorType::UNIFORM_BUFFER
        };
        self.declare(set, binding, ty, stages)
    }

    pub fn set_texture_location(&mut self, set: u32, binding: u32, stages: vk::ShaderStageFlags) -> &mut Self {
        self.declare(set, binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages)
    }

    pub fn set_storage_buffer_location(&mut self, set: u32, binding: u32, stages: vk::ShaderStageFlags) -> &mut Self {
        self.declare(set, binding, vk::DescriptorType::STORAGE_BUFFER, stages)
    }

    pub fn set_storage_image_location(&mut self, set: u32, binding: u32, stages: vk::ShaderStageFlags) -> &mut Self {
        self.declare(set, binding, vk::DescriptorType::STORAGE_IMAGE, stages)
    }

    pub fn set_push_constant(&mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> &mut Self {
        self.desc.add_push_constant(stages, offset, size);
        self
    }

    /// Create the descriptor set layouts.
    pub unsafe fn build_layout(&mut self) -> CoreResult<()> {
        if self.desc.state() != LayoutState::Declaring {
            return Ok(());
        }

        for set in 0..self.desc.set_count() {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
                .desc
                .bindings(set)
                .iter()
                .map(|b| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(b.binding)
                        .descriptor_type(b.ty)
                        .descriptor_count(b.count)
                        .stage_flags(b.stages)
                })
                .collect();

            let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            let layout = self
                .device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| CoreError::vk("Failed to create descriptor set layout", e))?;
            self.set_layouts.push(layout);
        }

        self.desc.advance(LayoutState::SetsBuilt);
        Ok(())
    }

    /// Create the pipeline layout (building the set layouts first if needed).
    pub unsafe fn build(&mut self) -> CoreResult<()> {
        match self.desc.state() {
            LayoutState::Built => return Ok(()),
            LayoutState::Declaring => self.build_layout()?,
            LayoutState::SetsBuilt => {}
        }

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(self.desc.push_constants());

        self.handle = self
            .device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| CoreError::vk("Failed to create pipeline layout", e))?;

        self.desc.advance(LayoutState::Built);
        log::debug!("{}: {} set layouts", self.desc.name, self.set_layouts.len());
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.desc.state() == LayoutState::Built
    }

    /// The pipeline layout, once built.
    pub fn handle(&self) -> Option<vk::PipelineLayout> {
        self.is_built().then_some(self.handle)
    }

    pub fn set_layout(&self, set: u32) -> Option<vk::DescriptorSetLayout> {
        self.set_layouts.get(set as usize).copied()
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            if self.handle != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.handle, None);
            }
            for layout in self.set_layouts.drain(..) {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(binding: u32) -> LayoutBinding {
        LayoutBinding {
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages: vk::ShaderStageFlags::VERTEX,
        }
    }

    #[test]
    fn test_set_count_covers_gaps() {
        let mut desc = LayoutDesc::new("test");
        assert_eq!(desc.set_count(), 0);
        desc.add_binding(2, uniform(0));
        assert_eq!(desc.set_count(), 3);
        assert!(desc.bindings(0).is_empty());
        assert_eq!(desc.bindings(2).len(), 1);
    }

    #[test]
    fn test_bindings_sorted_and_redeclaration_replaces() {
        let mut desc = LayoutDesc::new("test");
        desc.add_binding(0, uniform(3));
        desc.add_binding(0, uniform(1));
        desc.add_binding(
            0,
            LayoutBinding { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, ..uniform(3) },
        );
        let bindings = desc.bindings(0);
        assert_eq!(bindings.iter().map(|b| b.binding).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(bindings[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn test_mutation_after_build_is_ignored() {
        let mut desc = LayoutDesc::new("test");
        assert!(desc.add_binding(0, uniform(0)));
        assert!(desc.add_push_constant(vk::ShaderStageFlags::VERTEX, 0, 64));
        desc.advance(LayoutState::SetsBuilt);

        assert!(!desc.add_binding(0, uniform(1)));
        assert!(!desc.add_push_constant(vk::ShaderStageFlags::FRAGMENT, 64, 16));
        assert_eq!(desc.bindings(0).len(), 1);
        assert_eq!(desc.push_constants().len(), 1);
    }

    #[test]
    fn test_dynamic_bindings() {
        let mut desc = LayoutDesc::new("test");
        desc.add_binding(1, uniform(0));
        desc.add_binding(1, LayoutBinding { ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, ..uniform(4) });
        desc.add_binding(1, LayoutBinding { ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, ..uniform(2) });
        assert_eq!(desc.dynamic_bindings(1), vec![2, 4]);
        assert!(desc.dynamic_bindings(0).is_empty());
    }
}
