use std::path::Path;

use ash::vk;

use super::graphics::{create_shader_module, load_shader_module, pack_specialization, SHADER_ENTRY};
use super::layout::PipelineLayout;
use crate::error::{CoreError, CoreResult};

/// A single compute shader bound to one layout.
pub struct ComputePipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    device: ash::Device,
}

impl ComputePipeline {
    /// `specialization` is (constant id, value), as for graphics pipelines.
    pub unsafe fn new(
        device: &ash::Device,
        layout: &PipelineLayout,
        shader: &Path,
        specialization: &[(u32, u32)],
    ) -> CoreResult<Self> {
        let module = load_shader_module(device, shader)?;
        Self::with_module(device, layout, module, specialization)
    }

    /// Same as `new`, from SPIR-V words already in memory.
    pub unsafe fn from_code(
        device: &ash::Device,
        layout: &PipelineLayout,
        code: &[u32],
        specialization: &[(u32, u32)],
    ) -> CoreResult<Self> {
        let module = create_shader_module(device, code)?;
        Self::with_module(device, layout, module, specialization)
    }

    /// Takes ownership of `module`.
    unsafe fn with_module(
        device: &ash::Device,
        layout: &PipelineLayout,
        module: vk::ShaderModule,
        specialization: &[(u32, u32)],
    ) -> CoreResult<Self> {
        let Some(layout_handle) = layout.handle() else {
            device.destroy_shader_module(module, None);
            return Err(CoreError::Misuse("compute pipeline built on an unbuilt layout".into()));
        };

        let (entries, data) = pack_specialization(specialization);
        let spec_info = vk::SpecializationInfo::default().map_entries(&entries).data(&data);

        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(SHADER_ENTRY);
        if !entries.is_empty() {
            stage = stage.specialization_info(&spec_info);
        }

        let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout_handle);
        let result = device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None);
        device.destroy_shader_module(module, None);

        let pipelines = result.map_err(|(_, e)| CoreError::vk("Failed to create compute pipeline", e))?;
        Ok(Self { handle: pipelines[0], layout: layout_handle, device: device.clone() })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}
