//! Graphics pipelines.
//!
//! All fixed-function state lives in `PipelineState`, a plain value that is
//! filled in and then baked by `Pipeline::new`. Shader variants come from
//! specialization constants rather than separate SPIR-V files.

use std::ffi::CStr;
use std::path::Path;

use ash::vk;

use super::layout::PipelineLayout;
use crate::buffer::VertexArray;
use crate::error::{CoreError, CoreResult};

pub const SHADER_ENTRY: &CStr = c"main";

/// Load a SPIR-V file and wrap it in a shader module.
pub unsafe fn load_shader_module(device: &ash::Device, path: &Path) -> CoreResult<vk::ShaderModule> {
    let mut file = std::fs::File::open(path).map_err(|e| CoreError::io(path, e))?;
    let code = ash::util::read_spv(&mut file).map_err(|e| CoreError::io(path, e))?;
    create_shader_module(device, &code)
}

pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> CoreResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&create_info, None)
        .map_err(|e| CoreError::vk("Failed to create shader module", e))
}

/// Map entries plus the packed data block for (constant id, u32 value) pairs.
pub fn pack_specialization(constants: &[(u32, u32)]) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
    let size = std::mem::size_of::<u32>();
    let entries = constants
        .iter()
        .enumerate()
        .map(|(i, &(id, _))| vk::SpecializationMapEntry { constant_id: id, offset: (i * size) as u32, size })
        .collect();
    let data = constants.iter().flat_map(|&(_, v)| v.to_ne_bytes()).collect();
    (entries, data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum BlendMode {
    #[default]
    None,
    /// src_alpha, 1 - src_alpha
    Alpha,
    /// src_alpha, one
    Additive,
    /// one, 1 - src_alpha
    Premultiplied,
    /// dst_color, zero
    Multiply,
}

impl BlendMode {
    pub fn attachment(self) -> vk::PipelineColorBlendAttachmentState {
        let base = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
        let (src, dst) = match self {
            BlendMode::None => return base.blend_enable(false),
            BlendMode::Alpha => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
            BlendMode::Additive => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE),
            BlendMode::Premultiplied => (vk::BlendFactor::ONE, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
            BlendMode::Multiply => (vk::BlendFactor::DST_COLOR, vk::BlendFactor::ZERO),
        };
        base.blend_enable(true)
            .src_color_blend_factor(src)
            .dst_color_blend_factor(dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    /// (stage, SPIR-V file relative to the shader directory)
    pub shaders: Vec<(vk::ShaderStageFlags, String)>,
    /// (constant id, value), shared by every stage
    pub specialization: Vec<(u32, u32)>,
    pub subpass: u32,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            blend: BlendMode::None,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            shaders: Vec::new(),
            specialization: Vec::new(),
            subpass: 0,
        }
    }
}

impl PipelineState {
    pub fn shader(mut self, stage: vk::ShaderStageFlags, file: &str) -> Self {
        self.shaders.push((stage, file.to_string()));
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn primitive_restart(mut self, enable: bool) -> Self {
        self.primitive_restart = enable;
        self
    }

    /// Restart is only legal on strip and fan topologies.
    pub fn restart_enabled(&self) -> bool {
        self.primitive_restart
            && matches!(
                self.topology,
                vk::PrimitiveTopology::LINE_STRIP
                    | vk::PrimitiveTopology::TRIANGLE_STRIP
                    | vk::PrimitiveTopology::TRIANGLE_FAN
            )
    }

    pub fn blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write && test;
        self
    }

    pub fn cull(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    pub fn line_width(mut self, width: f32) -> Self {
        self.line_width = width.max(1.0);
        self
    }

    pub fn specialize(mut self, id: u32, value: u32) -> Self {
        match self.specialization.iter_mut().find(|(i, _)| *i == id) {
            Some(entry) => entry.1 = value,
            None => self.specialization.push((id, value)),
        }
        self
    }

    pub fn depth_stencil(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
    }

    pub fn rasterization(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .line_width(self.line_width)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false)
    }

    pub fn specialization_data(&self) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
        pack_specialization(&self.specialization)
    }
}

pub struct Pipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    device: ash::Device,
}

impl Pipeline {
    pub unsafe fn new(
        device: &ash::Device,
        layout: &PipelineLayout,
        render_pass: vk::RenderPass,
        vertex: Option<&VertexArray>,
        state: &PipelineState,
        shader_dir: &Path,
    ) -> CoreResult<Self> {
        let layout_handle = layout
            .handle()
            .ok_or_else(|| CoreError::Misuse("pipeline built on an unbuilt layout".into()))?;
        if state.shaders.is_empty() {
            return Err(CoreError::Misuse("pipeline without shaders".into()));
        }

        let mut modules = Vec::with_capacity(state.shaders.len());
        for (_, file) in &state.shaders {
            match load_shader_module(device, &shader_dir.join(file)) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        device.destroy_shader_module(module, None);
                    }
                    return Err(e);
                }
            }
        }

        let (spec_entries, spec_data) = state.specialization_data();
        let spec_info = vk::SpecializationInfo::default().map_entries(&spec_entries).data(&spec_data);

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = state
            .shaders
            .iter()
            .zip(&modules)
            .map(|(&(stage, _), &module)| {
                let info = vk::PipelineShaderStageCreateInfo::default().stage(stage).module(module).name(SHADER_ENTRY);
                if spec_entries.is_empty() { info } else { info.specialization_info(&spec_info) }
            })
            .collect();

        let (bindings, attributes) = match vertex {
            Some(va) => (va.binding_descriptions(), va.attribute_descriptions()),
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.topology)
            .primitive_restart_enable(state.restart_enabled());

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);

        let rasterizer = state.rasterization();
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = state.depth_stencil();

        let blend_attachments = [state.blend.attachment()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout_handle)
            .render_pass(render_pass)
            .subpass(state.subpass);

        let result = device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        for module in modules {
            device.destroy_shader_module(module, None);
        }

        let pipelines = result.map_err(|(_, e)| CoreError::vk("Failed to create graphics pipeline", e))?;
        Ok(Self { handle: pipelines[0], layout: layout_handle, device: device.clone() })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_modes() {
        assert_eq!(BlendMode::None.attachment().blend_enable, vk::FALSE);

        let alpha = BlendMode::Alpha.attachment();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);

        let add = BlendMode::Additive.attachment();
        assert_eq!(add.dst_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(add.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn test_depth_write_requires_test() {
        let state = PipelineState::default().depth(false, true);
        assert!(!state.depth_write);
        let ds = state.depth_stencil();
        assert_eq!(ds.depth_write_enable, vk::FALSE);

        let state = PipelineState::default().depth(true, true);
        assert_eq!(state.depth_stencil().depth_write_enable, vk::TRUE);
    }

    #[test]
    fn test_specialization_packing() {
        let state = PipelineState::default().specialize(0, 7).specialize(3, 1).specialize(0, 9);
        let (entries, data) = state.specialization_data();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].constant_id, 0);
        assert_eq!(entries[1].constant_id, 3);
        assert_eq!(entries[1].offset, 4);
        assert_eq!(entries[1].size, 4);
        assert_eq!(data.len(), 8);
        assert_eq!(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]), 9);
    }

    #[test]
    fn test_line_width_floor() {
        let state = PipelineState::default().line_width(0.0);
        assert_eq!(state.rasterization().line_width, 1.0);
    }

    #[test]
    fn test_shader_list() {
        let state = PipelineState::default()
            .shader(vk::ShaderStageFlags::VERTEX, "star.vert.spv")
            .shader(vk::ShaderStageFlags::FRAGMENT, "star.frag.spv")
            .topology(vk::PrimitiveTopology::POINT_LIST)
            .primitive_restart(true);
        assert_eq!(state.shaders.len(), 2);
        assert_eq!(state.topology, vk::PrimitiveTopology::POINT_LIST);
        assert!(!state.restart_enabled());
        assert!(state.topology(vk::PrimitiveTopology::LINE_STRIP).restart_enabled());
    }
}
