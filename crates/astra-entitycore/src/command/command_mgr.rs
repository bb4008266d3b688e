//! CommandMgr: per-frame command buffers, recording and batched submission.
//!
//! Callers reserve slots once with `get_command_index`. A single-use slot
//! owns one command buffer per frame in flight and is re-recorded every
//! time that frame comes round. A persistent slot is recorded once: every
//! recording call is replicated into all frames' copies so they stay
//! identical; only descriptor contents differ per frame.
//!
//! Each frame then schedules its compiled slots with `set_submission` and
//! hands them to the GPU with `submit`. See `submission` for how the batches
//! are chained.
//!
//! A submit that fails after its first batch went out leaves the frame's
//! chain semaphores signalled and its swapchain image acquired but never
//! presented. The chain is rebuilt and `take_link_lost` tells the caller to
//! recreate the surface before the next frame.

use std::ops::Range;
use std::time::Duration;

use ash::vk;

use super::event::CommandRecorder;
use super::slot::{CompileAction, InitAction, SlotState};
use super::submission::SubmissionGraph;
use crate::buffer::{IndexBuffer, SubBuffer, VertexBuffer};
use crate::config::CoreConfig;
use crate::descriptor::Set;
use crate::error::{CoreError, CoreResult};
use crate::pipeline::BindablePipeline;
use crate::vulkan::{FrameLink, QueueTarget, RenderPassInfo, Vulkan};

/// Longest `begin_frame` waits for a frame's previous submission.
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct SlotInfo {
    single_use: bool,
    target: QueueTarget,
    family: u32,
}

/// Why `set_submission` refused a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    UnknownSlot,
    WrongQueue { allocated: QueueTarget },
    NotReady(SlotState),
    Duplicate,
}

/// Reserved slots, up to a fixed capacity.
struct SlotTable {
    infos: Vec<SlotInfo>,
    capacity: usize,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self { infos: Vec::new(), capacity: capacity.max(1) }
    }

    fn has_room(&self) -> bool {
        if self.infos.len() >= self.capacity {
            log::error!("All {} command slots are in use", self.capacity);
            return false;
        }
        true
    }

    fn push(&mut self, info: SlotInfo) -> usize {
        self.infos.push(info);
        self.infos.len() - 1
    }

    /// The slot, if it may run on `target`'s queue family.
    fn for_target(&self, index: usize, target: QueueTarget, families: &[u32; 3]) -> Result<&SlotInfo, Refusal> {
        let info = self.infos.get(index).ok_or(Refusal::UnknownSlot)?;
        if info.family != families[target_index(target)] {
            return Err(Refusal::WrongQueue { allocated: info.target });
        }
        Ok(info)
    }
}

/// Whether slot `index`, now in `state`, may join the frame's batches.
fn admit(state: SlotState, queued: &[usize], index: usize) -> Result<(), Refusal> {
    if !state.is_submittable() {
        return Err(Refusal::NotReady(state));
    }
    if queued.contains(&index) {
        return Err(Refusal::Duplicate);
    }
    Ok(())
}

/// Close every open recording among `states`. Returns the positions whose
/// command buffer must be ended, and whether a render pass is still open.
fn end_recordings<'a>(states: impl Iterator<Item = &'a mut SlotState>) -> Vec<(usize, bool)> {
    states
        .enumerate()
        .filter_map(|(i, state)| match state.compile() {
            CompileAction::End { close_render_pass } => Some((i, close_render_pass)),
            CompileAction::NotRecording => None,
        })
        .collect()
}

/// Restart recording on every state. Returns the positions left recording,
/// which are ended first, and whether a render pass is still open.
fn begin_recordings<'a>(states: impl Iterator<Item = &'a mut SlotState>) -> Vec<(usize, Option<bool>)> {
    states
        .enumerate()
        .map(|(i, state)| match state.init() {
            InitAction::ImplicitCompile { in_render_pass } => (i, Some(in_render_pass)),
            InitAction::Begin => (i, None),
        })
        .collect()
}

/// Cleanup after batch `failed` of a frame's submit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubmitFailure {
    /// Earlier batches are queued and may still use the frame's buffers.
    wait_idle: bool,
    /// Earlier batches signalled chain semaphores nobody will wait on.
    reset_chain: bool,
    /// The acquired image won't be presented; the surface must be rebuilt.
    link_lost: bool,
}

fn after_failed_submit(failed: usize, link: &FrameLink) -> SubmitFailure {
    SubmitFailure {
        wait_idle: failed > 0,
        reset_chain: failed > 0,
        link_lost: link.top != vk::Semaphore::null() || link.bottom != vk::Semaphore::null(),
    }
}

struct FrameRecord {
    pools: Vec<(u32, vk::CommandPool)>,
    commands: Vec<vk::CommandBuffer>,
    states: Vec<SlotState>,
    fence: vk::Fence,
    chain: Vec<vk::Semaphore>,
    graph: SubmissionGraph,
    queued: Vec<usize>,
    in_flight: bool,
}

pub struct CommandMgr {
    frames: Vec<FrameRecord>,
    slots: SlotTable,
    current: usize,
    selected: Option<usize>,
    link_lost: bool,
    families: [u32; 3],
    device: ash::Device,
}

fn target_index(target: QueueTarget) -> usize {
    match target {
        QueueTarget::Graphics => 0,
        QueueTarget::Compute => 1,
        QueueTarget::Transfer => 2,
    }
}

/// Frames a recording call on a slot touches.
fn frame_targets(single_use: bool, current: usize, frames: usize) -> Range<usize> {
    if single_use {
        current..current + 1
    } else {
        0..frames
    }
}

impl CommandMgr {
    pub unsafe fn new(ctx: &Vulkan, config: &CoreConfig) -> CoreResult<Self> {
        let frame_count = config.frames_in_flight.max(1);
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let fence = ctx
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| CoreError::vk("Failed to create frame fence", e))?;
            frames.push(FrameRecord {
                pools: Vec::new(),
                commands: Vec::new(),
                states: Vec::new(),
                fence,
                chain: Vec::new(),
                graph: SubmissionGraph::new(),
                queued: Vec::new(),
                in_flight: false,
            });
        }

        let mut mgr = Self {
            frames,
            slots: SlotTable::new(config.command_slots),
            current: 0,
            selected: None,
            link_lost: false,
            families: [
                ctx.queue(QueueTarget::Graphics).family,
                ctx.queue(QueueTarget::Compute).family,
                ctx.queue(QueueTarget::Transfer).family,
            ],
            device: ctx.device.clone(),
        };

        // Command pool creation failing here is fatal; later pools are
        // created on demand.
        let graphics = mgr.families[0];
        for f in 0..frame_count {
            mgr.pool_for(f, graphics)?;
        }
        Ok(mgr)
    }

    unsafe fn pool_for(&mut self, frame: usize, family: u32) -> CoreResult<vk::CommandPool> {
        if let Some(&(_, pool)) = self.frames[frame].pools.iter().find(|(fam, _)| *fam == family) {
            return Ok(pool);
        }
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = self
            .device
            .create_command_pool(&pool_info, None)
            .map_err(|e| CoreError::vk("Failed to create command pool", e))?;
        self.frames[frame].pools.push((family, pool));
        Ok(pool)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slots.infos.len()
    }

    pub fn slot_state(&self, index: usize, frame: usize) -> Option<SlotState> {
        self.frames.get(frame)?.states.get(index).copied()
    }

    pub fn command_buffer(&self, index: usize, frame: usize) -> Option<vk::CommandBuffer> {
        self.frames.get(frame)?.commands.get(index).copied()
    }

    // ============================================================
    // Slots
    // ============================================================

    /// Reserve a command slot. `None` (logged) once every slot is taken or
    /// the command buffers can't be allocated.
    pub fn get_command_index(&mut self, single_use: bool, target: QueueTarget) -> Option<usize> {
        if !self.slots.has_room() {
            return None;
        }
        let family = self.families[target_index(target)];

        let mut allocated = Vec::with_capacity(self.frames.len());
        for f in 0..self.frames.len() {
            let cmd = unsafe {
                self.pool_for(f, family).and_then(|pool| {
                    let alloc_info = vk::CommandBufferAllocateInfo::default()
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1);
                    self.device
                        .allocate_command_buffers(&alloc_info)
                        .map(|buffers| (pool, buffers[0]))
                        .map_err(|e| CoreError::vk("Failed to allocate command buffer", e))
                })
            };
            match cmd {
                Ok(pair) => allocated.push(pair),
                Err(e) => {
                    log::error!("Command slot allocation failed: {}", e);
                    unsafe {
                        for (pool, cmd) in allocated {
                            self.device.free_command_buffers(pool, &[cmd]);
                        }
                    }
                    return None;
                }
            }
        }

        for (frame, (_, cmd)) in self.frames.iter_mut().zip(allocated) {
            frame.commands.push(cmd);
            frame.states.push(SlotState::Idle);
        }
        Some(self.slots.push(SlotInfo { single_use, target, family }))
    }

    // ============================================================
    // Frame pacing
    // ============================================================

    unsafe fn wait_frame(&mut self, f: usize) -> bool {
        let frame = &mut self.frames[f];
        if !frame.in_flight {
            return true;
        }
        let timeout = FRAME_WAIT_TIMEOUT.as_nanos() as u64;
        if let Err(e) = self.device.wait_for_fences(&[frame.fence], true, timeout) {
            log::error!("Frame {} did not finish: {:?}", f, e);
            return false;
        }
        if let Err(e) = self.device.reset_fences(&[frame.fence]) {
            log::error!("Failed to reset frame {} fence: {:?}", f, e);
            return false;
        }
        frame.in_flight = false;
        for (state, slot) in frame.states.iter_mut().zip(&self.slots.infos) {
            state.retire(slot.single_use);
        }
        true
    }

    /// Start recording frame `frame`: wait for its previous submission and
    /// recycle its single-use slots. False if the wait timed out.
    pub fn begin_frame(&mut self, frame: usize) -> bool {
        self.current = frame % self.frames.len();
        self.selected = None;
        let ok = unsafe { self.wait_frame(self.current) };
        let record = &mut self.frames[self.current];
        record.graph.clear();
        record.queued.clear();
        if ok && !record.in_flight {
            for (state, slot) in record.states.iter_mut().zip(&self.slots.infos) {
                state.retire(slot.single_use);
            }
        }
        ok
    }

    /// Wait for every frame in flight.
    pub fn wait_all(&mut self) -> bool {
        (0..self.frames.len()).fold(true, |ok, f| unsafe { self.wait_frame(f) } && ok)
    }

    // ============================================================
    // Recording
    // ============================================================

    /// Apply `record` to every command buffer the selected slot records into,
    /// where `guard` allows it.
    fn record(
        &mut self,
        what: &str,
        mut guard: impl FnMut(&mut SlotState) -> bool,
        record: impl Fn(&ash::Device, vk::CommandBuffer, usize),
    ) -> bool {
        let Some(slot) = self.selected else {
            log::warn!("{} with no command slot selected", what);
            return false;
        };
        let device = &self.device;
        let mut recorded = false;
        for f in frame_targets(self.slots.infos[slot].single_use, self.current, self.frames.len()) {
            let frame = &mut self.frames[f];
            if guard(&mut frame.states[slot]) {
                record(device, frame.commands[slot], f);
                recorded = true;
            }
        }
        if !recorded {
            log::warn!("{} ignored in slot {} ({:?})", what, slot, self.frames[self.current].states[slot]);
        }
        recorded
    }

    fn compile_slot(&mut self, slot: usize) -> bool {
        let targets = frame_targets(self.slots.infos[slot].single_use, self.current, self.frames.len());
        let first = targets.start;
        let ends = end_recordings(self.frames[targets].iter_mut().map(|frame| &mut frame.states[slot]));

        let device = &self.device;
        let mut compiled = false;
        for (i, close_render_pass) in ends {
            let f = first + i;
            let frame = &mut self.frames[f];
            let cmd = frame.commands[slot];
            unsafe {
                if close_render_pass {
                    device.cmd_end_render_pass(cmd);
                }
                if let Err(e) = device.end_command_buffer(cmd) {
                    log::error!("Failed to end command buffer {} (frame {}): {:?}", slot, f, e);
                    frame.states[slot] = SlotState::Idle;
                    continue;
                }
            }
            compiled = true;
        }
        compiled
    }

    /// Bind through `Set::get`, so pending descriptor writes land first.
    pub fn bind_set(&mut self, pipeline: &dyn BindablePipeline, set: &mut Set, set_index: u32) -> bool {
        let handle = unsafe { set.get() };
        let offsets = set.dynamic_offsets();
        self.bind_descriptor_set(pipeline.layout(), pipeline.bind_point(), set_index, handle, &offsets)
    }

    pub fn bind_pipeline(&mut self, pipeline: &dyn BindablePipeline) -> bool {
        self.bind_pipeline_handle(pipeline.handle(), pipeline.bind_point())
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &VertexBuffer) -> bool {
        self.bind_vertex_buffers(binding, &[buffer.binding()])
    }

    pub fn bind_index(&mut self, buffer: &IndexBuffer) -> bool {
        let (handle, offset) = buffer.binding();
        self.bind_index_buffer(handle, offset, IndexBuffer::INDEX_TYPE)
    }

    pub fn indirect_draw(&mut self, args: &SubBuffer, draw_count: u32, stride: u32) -> bool {
        self.draw_indirect(args.buffer, args.offset, draw_count, stride, false)
    }

    pub fn indirect_draw_indexed(&mut self, args: &SubBuffer, draw_count: u32, stride: u32) -> bool {
        self.draw_indirect(args.buffer, args.offset, draw_count, stride, true)
    }

    /// Record arbitrary commands (copies, barriers) outside a render pass.
    pub fn record_outside_render_pass(&mut self, record: impl Fn(&ash::Device, vk::CommandBuffer)) -> bool {
        self.record(
            "transfer recording",
            |s| s.is_recording() && !s.in_render_pass(),
            |device, cmd, _| record(device, cmd),
        )
    }

    // ============================================================
    // Submission
    // ============================================================

    /// Destroy frame `f`'s chain semaphores; `ensure_chain` makes new ones.
    /// Nothing may still wait on or signal them.
    unsafe fn reset_chain(&mut self, f: usize) {
        for semaphore in self.frames[f].chain.drain(..) {
            self.device.destroy_semaphore(semaphore, None);
        }
    }

    /// True once after a submit abandoned a frame whose swapchain image was
    /// acquired; recreate the surface before the next `begin_frame`.
    pub fn take_link_lost(&mut self) -> bool {
        std::mem::take(&mut self.link_lost)
    }

    unsafe fn ensure_chain(&mut self, f: usize, len: usize) -> CoreResult<()> {
        while self.frames[f].chain.len() < len {
            let semaphore = self
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(|e| CoreError::vk("Failed to create chain semaphore", e))?;
            self.frames[f].chain.push(semaphore);
        }
        Ok(())
    }

    /// Submit everything scheduled for the current frame. On failure the
    /// frame is dropped (logged) and false returned.
    pub fn submit(&mut self, ctx: &Vulkan, link: &FrameLink) -> bool {
        let f = self.current;
        unsafe {
            if self.frames[f].in_flight && !self.wait_frame(f) {
                self.drop_frame(f);
                return false;
            }

            let chain_len = self.frames[f].graph.chain_len(link);
            if let Err(e) = self.ensure_chain(f, chain_len) {
                log::error!("Frame {} dropped: {}", f, e);
                self.drop_frame(f);
                return false;
            }

            let frame = &self.frames[f];
            let Some(batches) = frame.graph.resolve(link, &frame.chain) else {
                log::error!("Frame {} dropped: semaphore chain too short", f);
                self.drop_frame(f);
                return false;
            };

            let last = batches.len().saturating_sub(1);
            for (i, batch) in batches.iter().enumerate() {
                let info = vk::SubmitInfo::default()
                    .wait_semaphores(&batch.wait)
                    .wait_dst_stage_mask(&batch.wait_stages)
                    .command_buffers(&batch.commands)
                    .signal_semaphores(&batch.signal);
                let fence = if i == last { frame.fence } else { vk::Fence::null() };

                if let Err(e) = ctx.queue(batch.target).submit(&ctx.device, &[info], fence) {
                    log::error!("Frame {} batch {}/{} submit failed: {:?}; frame dropped", f, i + 1, batches.len(), e);
                    let failure = after_failed_submit(i, link);
                    if failure.wait_idle {
                        ctx.wait_idle();
                    }
                    if failure.reset_chain {
                        self.reset_chain(f);
                    }
                    if failure.link_lost {
                        log::warn!("Frame {} never reached the swapchain; the surface must be recreated", f);
                        self.link_lost = true;
                    }
                    self.drop_frame(f);
                    return false;
                }
            }

            let frame = &mut self.frames[f];
            for &slot in &frame.queued {
                frame.states[slot].mark_submitted();
            }
            frame.in_flight = !batches.is_empty();
            frame.queued.clear();
            frame.graph.clear();
        }
        true
    }

    fn drop_frame(&mut self, f: usize) {
        let frame = &mut self.frames[f];
        frame.graph.clear();
        frame.queued.clear();
    }
}

impl CommandRecorder for CommandMgr {
    fn init(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.infos.get(index) else {
            log::error!("init on unknown command slot {}", index);
            return false;
        };
        let single_use = slot.single_use;

        if single_use {
            let frame = &self.frames[self.current];
            if frame.in_flight && frame.states[index] == SlotState::Submitted {
                log::error!("Slot {} re-recorded while frame {} is in flight", index, self.current);
                return false;
            }
        } else {
            // Every frame's copy gets re-recorded.
            for f in 0..self.frames.len() {
                if self.frames[f].states[index] == SlotState::Submitted && !unsafe { self.wait_frame(f) } {
                    return false;
                }
            }
        }

        let flags = if single_use {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let targets = frame_targets(single_use, self.current, self.frames.len());
        let first = targets.start;
        let starts = begin_recordings(self.frames[targets].iter_mut().map(|frame| &mut frame.states[index]));

        let device = &self.device;
        let mut begun = false;
        for (i, open) in starts {
            let f = first + i;
            let frame = &mut self.frames[f];
            let cmd = frame.commands[index];
            unsafe {
                if let Some(in_render_pass) = open {
                    log::warn!("Slot {} was still recording; compiling it first", index);
                    if in_render_pass {
                        device.cmd_end_render_pass(cmd);
                    }
                    let _ = device.end_command_buffer(cmd);
                }
                let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
                if let Err(e) = device.begin_command_buffer(cmd, &begin_info) {
                    log::error!("Failed to begin command buffer {} (frame {}): {:?}", index, f, e);
                    frame.states[index] = SlotState::Idle;
                    continue;
                }
            }
            begun = true;
        }

        self.selected = begun.then_some(index);
        begun
    }

    fn begin_render_pass(&mut self, info: &RenderPassInfo) -> bool {
        self.record("begin_render_pass", SlotState::begin_render_pass, |device, cmd, frame| unsafe {
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(info.render_pass)
                .framebuffer(info.framebuffer(frame))
                .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent: info.extent })
                .clear_values(&info.clear_values);
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: info.extent.width as f32,
                height: info.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[vk::Rect2D { offset: vk::Offset2D::default(), extent: info.extent }]);
        })
    }

    fn end_render_pass(&mut self) -> bool {
        self.record("end_render_pass", SlotState::end_render_pass, |device, cmd, _| unsafe {
            device.cmd_end_render_pass(cmd);
        })
    }

    fn bind_pipeline_handle(&mut self, pipeline: vk::Pipeline, bind_point: vk::PipelineBindPoint) -> bool {
        self.record("bind_pipeline", |s| s.bind_pipeline(bind_point), |device, cmd, _| unsafe {
            device.cmd_bind_pipeline(cmd, bind_point, pipeline);
        })
    }

    fn bind_descriptor_set(
        &mut self,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) -> bool {
        self.record("bind_set", |s| s.can_bind_set(bind_point), |device, cmd, _| unsafe {
            device.cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, &[set], dynamic_offsets);
        })
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(vk::Buffer, u64)]) -> bool {
        let handles: Vec<vk::Buffer> = buffers.iter().map(|b| b.0).collect();
        let offsets: Vec<u64> = buffers.iter().map(|b| b.1).collect();
        self.record("bind_vertex_buffers", |s| s.in_render_pass(), |device, cmd, _| unsafe {
            device.cmd_bind_vertex_buffers(cmd, first_binding, &handles, &offsets);
        })
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) -> bool {
        self.record("bind_index_buffer", |s| s.in_render_pass(), |device, cmd, _| unsafe {
            device.cmd_bind_index_buffer(cmd, buffer, offset, index_type);
        })
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> bool {
        self.record("push_constants", |s| s.is_recording(), |device, cmd, _| unsafe {
            device.cmd_push_constants(cmd, layout, stages, offset, data);
        })
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> bool {
        self.record("draw", |s| s.can_draw(), |device, cmd, _| unsafe {
            device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        })
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> bool {
        self.record("draw_indexed", |s| s.can_draw(), |device, cmd, _| unsafe {
            device.cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance);
        })
    }

    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: u64, draw_count: u32, stride: u32, indexed: bool) -> bool {
        self.record("draw_indirect", |s| s.can_draw(), |device, cmd, _| unsafe {
            if indexed {
                device.cmd_draw_indexed_indirect(cmd, buffer, offset, draw_count, stride);
            } else {
                device.cmd_draw_indirect(cmd, buffer, offset, draw_count, stride);
            }
        })
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> bool {
        self.record("dispatch", |s| s.can_dispatch(), |device, cmd, _| unsafe {
            device.cmd_dispatch(cmd, x, y, z);
        })
    }

    fn compile(&mut self) -> bool {
        let Some(slot) = self.selected.take() else {
            log::warn!("compile with no command slot selected");
            return false;
        };
        self.compile_slot(slot)
    }

    fn set_submission(&mut self, index: usize, new_batch: bool, target: QueueTarget) -> bool {
        match self.slots.for_target(index, target, &self.families) {
            Ok(_) => {}
            Err(Refusal::WrongQueue { allocated }) => {
                log::error!("Slot {} was allocated for {:?} and can't run on {:?}", index, allocated, target);
                return false;
            }
            Err(_) => {
                log::error!("set_submission on unknown command slot {}", index);
                return false;
            }
        }

        let f = self.current;
        if self.frames[f].states[index].is_recording() {
            log::warn!("Slot {} submitted while recording; compiling it first", index);
            if self.selected == Some(index) {
                self.selected = None;
            }
            self.compile_slot(index);
        }

        let frame = &mut self.frames[f];
        match admit(frame.states[index], &frame.queued, index) {
            Ok(()) => {}
            Err(Refusal::Duplicate) => {
                log::warn!("Slot {} scheduled twice in frame {}", index, f);
                return false;
            }
            Err(refusal) => {
                log::error!("Slot {} is not ready to submit ({:?})", index, refusal);
                return false;
            }
        }

        frame.graph.push(frame.commands[index], new_batch, target);
        frame.queued.push(index);
        true
    }
}

impl Drop for CommandMgr {
    fn drop(&mut self) {
        self.wait_all();
        unsafe {
            for frame in &self.frames {
                for &semaphore in &frame.chain {
                    self.device.destroy_semaphore(semaphore, None);
                }
                self.device.destroy_fence(frame.fence, None);
                for &(_, pool) in &frame.pools {
                    self.device.destroy_command_pool(pool, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_frame_targets() {
        assert_eq!(frame_targets(true, 2, 3), 2..3);
        assert_eq!(frame_targets(false, 2, 3), 0..3);
    }

    #[test]
    fn test_target_index_is_distinct() {
        let indices = [QueueTarget::Graphics, QueueTarget::Compute, QueueTarget::Transfer].map(target_index);
        assert_eq!(indices, [0, 1, 2]);
    }

    // ============================================================
    // Slot table
    // ============================================================

    // Graphics and compute share family 0; transfer has its own.
    const FAMILIES: [u32; 3] = [0, 0, 2];

    fn info(target: QueueTarget) -> SlotInfo {
        SlotInfo { single_use: true, target, family: FAMILIES[target_index(target)] }
    }

    #[test]
    fn test_slot_capacity_is_enforced() {
        let mut table = SlotTable::new(2);
        assert!(table.has_room());
        assert_eq!(table.push(info(QueueTarget::Graphics)), 0);
        assert!(table.has_room());
        assert_eq!(table.push(info(QueueTarget::Transfer)), 1);
        assert!(!table.has_room());

        // A zero capacity still leaves one slot.
        assert!(SlotTable::new(0).has_room());
    }

    #[test]
    fn test_unknown_slot_is_refused() {
        let mut table = SlotTable::new(4);
        table.push(info(QueueTarget::Graphics));
        assert!(table.for_target(0, QueueTarget::Graphics, &FAMILIES).is_ok());
        assert_eq!(
            table.for_target(1, QueueTarget::Graphics, &FAMILIES).err(),
            Some(Refusal::UnknownSlot)
        );
    }

    #[test]
    fn test_queue_family_mismatch_is_refused() {
        let mut table = SlotTable::new(4);
        table.push(info(QueueTarget::Graphics));
        table.push(info(QueueTarget::Transfer));

        assert_eq!(
            table.for_target(0, QueueTarget::Transfer, &FAMILIES).err(),
            Some(Refusal::WrongQueue { allocated: QueueTarget::Graphics })
        );
        assert_eq!(
            table.for_target(1, QueueTarget::Graphics, &FAMILIES).err(),
            Some(Refusal::WrongQueue { allocated: QueueTarget::Transfer })
        );
        // Same family under another name is fine.
        assert!(table.for_target(0, QueueTarget::Compute, &FAMILIES).is_ok());
    }

    // ============================================================
    // Scheduling
    // ============================================================

    #[test]
    fn test_admit_requires_compiled_slot() {
        assert_eq!(admit(SlotState::Compiled, &[], 0), Ok(()));
        assert_eq!(admit(SlotState::Idle, &[], 0), Err(Refusal::NotReady(SlotState::Idle)));
        assert_eq!(admit(SlotState::Submitted, &[], 0), Err(Refusal::NotReady(SlotState::Submitted)));
        assert_eq!(admit(SlotState::RECORDING, &[], 0), Err(Refusal::NotReady(SlotState::RECORDING)));
    }

    #[test]
    fn test_duplicate_scheduling_is_refused() {
        assert_eq!(admit(SlotState::Compiled, &[3, 1], 1), Err(Refusal::Duplicate));
        assert_eq!(admit(SlotState::Compiled, &[3, 1], 2), Ok(()));
    }

    #[test]
    fn test_recording_slot_is_compiled_before_scheduling() {
        let mut state = SlotState::RECORDING;
        state.begin_render_pass();
        let ends = end_recordings(std::iter::once(&mut state));
        assert_eq!(ends, vec![(0, true)]);
        assert_eq!(admit(state, &[], 0), Ok(()));
    }

    #[test]
    fn test_end_recordings_skips_closed_frames() {
        let mut open = SlotState::RECORDING;
        open.begin_render_pass();
        let mut states = [open, SlotState::Compiled, SlotState::RECORDING, SlotState::Idle];
        let ends = end_recordings(states.iter_mut());
        assert_eq!(ends, vec![(0, true), (2, false)]);
        assert_eq!(states, [SlotState::Compiled, SlotState::Compiled, SlotState::Compiled, SlotState::Idle]);
    }

    #[test]
    fn test_init_compiles_open_recordings_first() {
        let mut open = SlotState::RECORDING;
        open.begin_render_pass();
        let mut states = [open, SlotState::Compiled, SlotState::RECORDING];
        let starts = begin_recordings(states.iter_mut());
        assert_eq!(starts, vec![(0, Some(true)), (1, None), (2, Some(false))]);
        assert!(states.iter().all(|s| *s == SlotState::RECORDING));
    }

    // ============================================================
    // Failed submits
    // ============================================================

    fn swapchain_link() -> FrameLink {
        FrameLink {
            top: vk::Semaphore::from_raw(1),
            top_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            bottom: vk::Semaphore::from_raw(2),
            tail: None,
        }
    }

    #[test]
    fn test_first_batch_failure_loses_only_the_link() {
        let failure = after_failed_submit(0, &swapchain_link());
        assert_eq!(failure, SubmitFailure { wait_idle: false, reset_chain: false, link_lost: true });
    }

    #[test]
    fn test_later_batch_failure_resets_chain() {
        let failure = after_failed_submit(2, &swapchain_link());
        assert_eq!(failure, SubmitFailure { wait_idle: true, reset_chain: true, link_lost: true });
    }

    #[test]
    fn test_headless_failure_keeps_link() {
        let failure = after_failed_submit(1, &FrameLink::headless());
        assert_eq!(failure, SubmitFailure { wait_idle: true, reset_chain: true, link_lost: false });
    }
}
