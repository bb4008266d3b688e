//! Deferred recording.
//!
//! Worker threads describe what they want recorded as `CmdEvent`s and send
//! them through a `CommandQueue`; the render thread replays them, in order,
//! on anything implementing `CommandRecorder` (normally `CommandMgr`).

use ash::vk;
use crossbeam::channel::{self, Receiver, Sender};

use crate::vulkan::{QueueTarget, RenderPassInfo};

/// Raw recording interface. Every handle passed in must stay alive until
/// the command buffers recording it have finished executing.
pub trait CommandRecorder {
    fn init(&mut self, index: usize) -> bool;
    fn begin_render_pass(&mut self, info: &RenderPassInfo) -> bool;
    fn end_render_pass(&mut self) -> bool;
    fn bind_pipeline_handle(&mut self, pipeline: vk::Pipeline, bind_point: vk::PipelineBindPoint) -> bool;
    fn bind_descriptor_set(
        &mut self,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) -> bool;
    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(vk::Buffer, u64)]) -> bool;
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) -> bool;
    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8])
        -> bool;
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> bool;
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> bool;
    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: u64, draw_count: u32, stride: u32, indexed: bool) -> bool;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> bool;
    fn compile(&mut self) -> bool;
    fn set_submission(&mut self, index: usize, new_batch: bool, target: QueueTarget) -> bool;
}

#[derive(Clone)]
pub enum CmdEvent {
    Init { index: usize },
    BeginRenderPass(RenderPassInfo),
    EndRenderPass,
    BindPipeline { pipeline: vk::Pipeline, bind_point: vk::PipelineBindPoint },
    BindSet {
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers { first_binding: u32, buffers: Vec<(vk::Buffer, u64)> },
    BindIndexBuffer { buffer: vk::Buffer, offset: u64, index_type: vk::IndexType },
    PushConstants { layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: Vec<u8> },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32 },
    DrawIndirect { buffer: vk::Buffer, offset: u64, draw_count: u32, stride: u32, indexed: bool },
    Dispatch { x: u32, y: u32, z: u32 },
    Compile,
    SetSubmission { index: usize, new_batch: bool, target: QueueTarget },
}

impl CmdEvent {
    /// Record this event. Returns what the recorder returned.
    pub fn apply(&self, rec: &mut dyn CommandRecorder) -> bool {
        match self {
            CmdEvent::Init { index } => rec.init(*index),
            CmdEvent::BeginRenderPass(info) => rec.begin_render_pass(info),
            CmdEvent::EndRenderPass => rec.end_render_pass(),
            CmdEvent::BindPipeline { pipeline, bind_point } => rec.bind_pipeline_handle(*pipeline, *bind_point),
            CmdEvent::BindSet { layout, bind_point, first_set, set, dynamic_offsets } => {
                rec.bind_descriptor_set(*layout, *bind_point, *first_set, *set, dynamic_offsets)
            }
            CmdEvent::BindVertexBuffers { first_binding, buffers } => rec.bind_vertex_buffers(*first_binding, buffers),
            CmdEvent::BindIndexBuffer { buffer, offset, index_type } => {
                rec.bind_index_buffer(*buffer, *offset, *index_type)
            }
            CmdEvent::PushConstants { layout, stages, offset, data } => {
                rec.push_constants(*layout, *stages, *offset, data)
            }
            CmdEvent::Draw { vertex_count, instance_count, first_vertex, first_instance } => {
                rec.draw(*vertex_count, *instance_count, *first_vertex, *first_instance)
            }
            CmdEvent::DrawIndexed { index_count, instance_count, first_index, vertex_offset, first_instance } => {
                rec.draw_indexed(*index_count, *instance_count, *first_index, *vertex_offset, *first_instance)
            }
            CmdEvent::DrawIndirect { buffer, offset, draw_count, stride, indexed } => {
                rec.draw_indirect(*buffer, *offset, *draw_count, *stride, *indexed)
            }
            CmdEvent::Dispatch { x, y, z } => rec.dispatch(*x, *y, *z),
            CmdEvent::Compile => rec.compile(),
            CmdEvent::SetSubmission { index, new_batch, target } => rec.set_submission(*index, *new_batch, *target),
        }
    }
}

/// Multi-producer event queue drained by the render thread.
pub struct CommandQueue {
    tx: Sender<CmdEvent>,
    rx: Receiver<CmdEvent>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// A handle other threads can push events through.
    pub fn sender(&self) -> Sender<CmdEvent> {
        self.tx.clone()
    }

    pub fn push(&self, event: CmdEvent) {
        // The receiver lives in self, so the channel can't be disconnected.
        let _ = self.tx.send(event);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Record every queued event. Returns how many were rejected by the
    /// recorder (out-of-order calls, unknown slots).
    pub fn replay(&self, rec: &mut dyn CommandRecorder) -> usize {
        let mut rejected = 0;
        for event in self.rx.try_iter() {
            if !event.apply(rec) {
                rejected += 1;
            }
        }
        if rejected > 0 {
            log::warn!("{} replayed commands were rejected", rejected);
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::slot::SlotState;

    /// Records call names, enforcing the slot state machine like the real
    /// recorder does.
    #[derive(Default)]
    struct MockRecorder {
        calls: Vec<String>,
        state: SlotState,
        submitted: Vec<(usize, bool, QueueTarget)>,
    }

    impl CommandRecorder for MockRecorder {
        fn init(&mut self, index: usize) -> bool {
            self.state.init();
            self.calls.push(format!("init {}", index));
            true
        }
        fn begin_render_pass(&mut self, _info: &RenderPassInfo) -> bool {
            self.calls.push("begin".into());
            self.state.begin_render_pass()
        }
        fn end_render_pass(&mut self) -> bool {
            self.calls.push("end".into());
            self.state.end_render_pass()
        }
        fn bind_pipeline_handle(&mut self, _p: vk::Pipeline, bind_point: vk::PipelineBindPoint) -> bool {
            self.calls.push("pipeline".into());
            self.state.bind_pipeline(bind_point)
        }
        fn bind_descriptor_set(
            &mut self,
            _layout: vk::PipelineLayout,
            bind_point: vk::PipelineBindPoint,
            _first_set: u32,
            _set: vk::DescriptorSet,
            dynamic_offsets: &[u32],
        ) -> bool {
            self.calls.push(format!("set {:?}", dynamic_offsets));
            self.state.can_bind_set(bind_point)
        }
        fn bind_vertex_buffers(&mut self, _first: u32, buffers: &[(vk::Buffer, u64)]) -> bool {
            self.calls.push(format!("vertex {}", buffers.len()));
            self.state.is_recording()
        }
        fn bind_index_buffer(&mut self, _b: vk::Buffer, _o: u64, _t: vk::IndexType) -> bool {
            self.calls.push("index".into());
            self.state.is_recording()
        }
        fn push_constants(&mut self, _l: vk::PipelineLayout, _s: vk::ShaderStageFlags, _o: u32, data: &[u8]) -> bool {
            self.calls.push(format!("push {}", data.len()));
            self.state.is_recording()
        }
        fn draw(&mut self, vertex_count: u32, _ic: u32, _fv: u32, _fi: u32) -> bool {
            self.calls.push(format!("draw {}", vertex_count));
            self.state.can_draw()
        }
        fn draw_indexed(&mut self, index_count: u32, _ic: u32, _fi: u32, _vo: i32, _fin: u32) -> bool {
            self.calls.push(format!("draw_indexed {}", index_count));
            self.state.can_draw()
        }
        fn draw_indirect(&mut self, _b: vk::Buffer, _o: u64, count: u32, _s: u32, _i: bool) -> bool {
            self.calls.push(format!("indirect {}", count));
            self.state.can_draw()
        }
        fn dispatch(&mut self, x: u32, _y: u32, _z: u32) -> bool {
            self.calls.push(format!("dispatch {}", x));
            self.state.can_dispatch()
        }
        fn compile(&mut self) -> bool {
            self.calls.push("compile".into());
            !matches!(self.state.compile(), crate::command::slot::CompileAction::NotRecording)
        }
        fn set_submission(&mut self, index: usize, new_batch: bool, target: QueueTarget) -> bool {
            self.submitted.push((index, new_batch, target));
            true
        }
    }

    fn pass() -> RenderPassInfo {
        RenderPassInfo {
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            extent: vk::Extent2D { width: 4, height: 4 },
            clear_values: Vec::new(),
        }
    }

    #[test]
    fn test_replay_preserves_order() {
        let queue = CommandQueue::new();
        let tx = queue.sender();
        std::thread::spawn(move || {
            tx.send(CmdEvent::Init { index: 3 }).unwrap();
            tx.send(CmdEvent::BeginRenderPass(pass())).unwrap();
            tx.send(CmdEvent::BindPipeline {
                pipeline: vk::Pipeline::null(),
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            })
            .unwrap();
            tx.send(CmdEvent::Draw { vertex_count: 6, instance_count: 1, first_vertex: 0, first_instance: 0 })
                .unwrap();
            tx.send(CmdEvent::Compile).unwrap();
            tx.send(CmdEvent::SetSubmission { index: 3, new_batch: true, target: QueueTarget::Graphics }).unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(queue.len(), 6);
        let mut rec = MockRecorder::default();
        assert_eq!(queue.replay(&mut rec), 0);
        assert_eq!(rec.calls, vec!["init 3", "begin", "pipeline", "draw 6", "compile"]);
        assert_eq!(rec.submitted, vec![(3, true, QueueTarget::Graphics)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_events_are_counted() {
        let queue = CommandQueue::new();
        queue.push(CmdEvent::Init { index: 0 });
        queue.push(CmdEvent::Draw { vertex_count: 3, instance_count: 1, first_vertex: 0, first_instance: 0 });
        queue.push(CmdEvent::Dispatch { x: 8, y: 1, z: 1 });
        queue.push(CmdEvent::EndRenderPass);

        let mut rec = MockRecorder::default();
        assert_eq!(queue.replay(&mut rec), 3);
        assert_eq!(rec.state, SlotState::RECORDING);
    }

    #[test]
    fn test_replay_empty_queue() {
        let queue = CommandQueue::default();
        let mut rec = MockRecorder::default();
        assert_eq!(queue.replay(&mut rec), 0);
        assert!(rec.calls.is_empty());
    }
}
