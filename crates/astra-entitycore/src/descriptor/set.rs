//! One descriptor set with buffered writes.
//!
//! `bind_*` only records what should be written. The writes are flushed in
//! one `vkUpdateDescriptorSets` call by `get`/`update`; a later bind on the
//! same binding replaces an earlier one that wasn't flushed yet.
//!
//! A set keeps every texture bound to it alive until the set itself is
//! dropped; the texture's image then outlives both by a frame cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::set_mgr::SetMgr;
use crate::buffer::{SubBuffer, Uniform};
use crate::error::CoreResult;
use crate::pipeline::PipelineLayout;
use crate::texture::Texture;

#[derive(Debug, Clone, Copy)]
pub enum PendingWrite {
    Buffer { binding: u32, ty: vk::DescriptorType, info: vk::DescriptorBufferInfo },
    Image { binding: u32, ty: vk::DescriptorType, info: vk::DescriptorImageInfo },
}

impl PendingWrite {
    pub fn binding(&self) -> u32 {
        match self {
            PendingWrite::Buffer { binding, .. } | PendingWrite::Image { binding, .. } => *binding,
        }
    }
}

/// Keep only the last write per binding, in binding order.
pub fn coalesce(writes: &[PendingWrite]) -> Vec<PendingWrite> {
    let mut last: BTreeMap<u32, PendingWrite> = BTreeMap::new();
    for w in writes {
        last.insert(w.binding(), *w);
    }
    last.into_values().collect()
}

pub struct Set {
    mgr: Arc<SetMgr>,
    pool: vk::DescriptorPool,
    handle: vk::DescriptorSet,
    pending: Vec<PendingWrite>,
    dynamic_offsets: BTreeMap<u32, u32>,
    textures: BTreeMap<u32, Arc<Texture>>,
    device: ash::Device,
}

impl Set {
    /// Allocate set `set_index` of `layout`; the layout's set layouts must exist.
    pub unsafe fn new(
        device: &ash::Device,
        mgr: &Arc<SetMgr>,
        layout: &PipelineLayout,
        set_index: u32,
    ) -> CoreResult<Self> {
        let set_layout = layout.set_layout(set_index).ok_or_else(|| {
            crate::error::CoreError::Misuse(format!("set {} of an unbuilt or smaller layout", set_index))
        })?;
        let (pool, handle) = mgr.allocate(set_layout)?;

        // Dynamic bindings start at offset 0 so the offset count always
        // matches the layout.
        let dynamic_offsets = layout.desc().dynamic_bindings(set_index).into_iter().map(|b| (b, 0)).collect();

        Ok(Self {
            mgr: mgr.clone(),
            pool,
            handle,
            pending: Vec::new(),
            dynamic_offsets,
            textures: BTreeMap::new(),
            device: device.clone(),
        })
    }

    pub fn bind_uniform(&mut self, binding: u32, uniform: &Uniform) -> &mut Self {
        if uniform.is_virtual() {
            self.dynamic_offsets.insert(binding, 0);
        }
        self.pending.push(PendingWrite::Buffer {
            binding,
            ty: uniform.descriptor_type(),
            info: uniform.descriptor_info(),
        });
        self
    }

    /// Bind a virtual uniform and select which instance draws read.
    pub fn bind_virtual_uniform(&mut self, binding: u32, uniform: &Uniform, instance: u32) -> &mut Self {
        self.bind_uniform(binding, uniform);
        self.dynamic_offsets.insert(binding, uniform.dynamic_offset(instance));
        self
    }

    /// Switch instance without rewriting the descriptor.
    pub fn set_dynamic_offset(&mut self, binding: u32, offset: u32) -> bool {
        match self.dynamic_offsets.get_mut(&binding) {
            Some(slot) => {
                *slot = offset;
                true
            }
            None => {
                log::warn!("Binding {} has no dynamic offset", binding);
                false
            }
        }
    }

    pub fn bind_texture(&mut self, binding: u32, texture: &Arc<Texture>) -> &mut Self {
        self.textures.insert(binding, texture.clone());
        self.bind_image(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, texture.descriptor_info())
    }

    /// Textures this set keeps alive, by binding.
    pub fn bound_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn bind_storage_buffer(&mut self, binding: u32, buffer: &SubBuffer) -> &mut Self {
        self.pending.push(PendingWrite::Buffer {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info: buffer.descriptor_info(),
        });
        self
    }

    pub fn bind_storage_image(&mut self, binding: u32, view: vk::ImageView) -> &mut Self {
        let info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::GENERAL,
        };
        self.bind_image(binding, vk::DescriptorType::STORAGE_IMAGE, info)
    }

    pub fn bind_image(&mut self, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorImageInfo) -> &mut Self {
        self.pending.push(PendingWrite::Image { binding, ty, info });
        self
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flush buffered writes. Returns the number of descriptors written.
    pub unsafe fn update(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let writes = coalesce(&self.pending);
        self.pending.clear();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|w| match w {
                PendingWrite::Buffer { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(self.handle)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info)),
                PendingWrite::Image { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(self.handle)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info)),
            })
            .collect();

        self.device.update_descriptor_sets(&vk_writes, &[]);
        vk_writes.len()
    }

    /// The set handle, with every buffered write applied.
    pub unsafe fn get(&mut self) -> vk::DescriptorSet {
        self.update();
        self.handle
    }

    /// Dynamic offsets for `cmd_bind_descriptor_sets`, in binding order.
    pub fn dynamic_offsets(&self) -> Vec<u32> {
        self.dynamic_offsets.values().copied().collect()
    }
}

impl Drop for Set {
    fn drop(&mut self) {
        self.mgr.release(self.pool, self.handle);
    }
}
