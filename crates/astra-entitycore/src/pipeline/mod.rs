//! Pipeline layouts plus graphics and compute pipelines.

pub mod compute;
pub mod graphics;
pub mod layout;

pub use compute::ComputePipeline;
pub use graphics::{BlendMode, Pipeline, PipelineState};
pub use layout::{LayoutBinding, LayoutDesc, LayoutState, PipelineLayout};

use ash::vk;

/// What `CommandMgr::bind_pipeline` needs from either kind of pipeline.
pub trait BindablePipeline {
    fn handle(&self) -> vk::Pipeline;
    fn layout(&self) -> vk::PipelineLayout;
    fn bind_point(&self) -> vk::PipelineBindPoint;
}

impl BindablePipeline for Pipeline {
    fn handle(&self) -> vk::Pipeline {
        Pipeline::handle(self)
    }
    fn layout(&self) -> vk::PipelineLayout {
        Pipeline::layout(self)
    }
    fn bind_point(&self) -> vk::PipelineBindPoint {
        Pipeline::bind_point(self)
    }
}

impl BindablePipeline for ComputePipeline {
    fn handle(&self) -> vk::Pipeline {
        ComputePipeline::handle(self)
    }
    fn layout(&self) -> vk::PipelineLayout {
        ComputePipeline::layout(self)
    }
    fn bind_point(&self) -> vk::PipelineBindPoint {
        ComputePipeline::bind_point(self)
    }
}
