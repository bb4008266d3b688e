//! Per-slot recording state.
//!
//! `Idle -> Recording -> Compiled -> Submitted`. While recording, the slot
//! tracks whether a render pass is open and which pipelines are bound; the
//! guards below turn out-of-order calls into no-ops instead of invalid
//! command buffers.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Recording {
        in_render_pass: bool,
        has_pipeline: bool,
        has_compute: bool,
    },
    Compiled,
    Submitted,
}

/// What `init` found on the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAction {
    Begin,
    /// A recording was left open; it must be ended before restarting.
    ImplicitCompile { in_render_pass: bool },
}

/// What `compile` must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileAction {
    NotRecording,
    End { close_render_pass: bool },
}

impl SlotState {
    pub const RECORDING: SlotState = SlotState::Recording { in_render_pass: false, has_pipeline: false, has_compute: false };

    pub fn init(&mut self) -> InitAction {
        let action = match *self {
            SlotState::Recording { in_render_pass, .. } => InitAction::ImplicitCompile { in_render_pass },
            _ => InitAction::Begin,
        };
        *self = Self::RECORDING;
        action
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, SlotState::Recording { .. })
    }

    pub fn in_render_pass(&self) -> bool {
        matches!(self, SlotState::Recording { in_render_pass: true, .. })
    }

    pub fn begin_render_pass(&mut self) -> bool {
        match self {
            SlotState::Recording { in_render_pass, has_pipeline, .. } if !*in_render_pass => {
                *in_render_pass = true;
                // Graphics bindings don't survive a render pass boundary.
                *has_pipeline = false;
                true
            }
            _ => false,
        }
    }

    pub fn end_render_pass(&mut self) -> bool {
        match self {
            SlotState::Recording { in_render_pass, has_pipeline, .. } if *in_render_pass => {
                *in_render_pass = false;
                *has_pipeline = false;
                true
            }
            _ => false,
        }
    }

    /// Graphics pipelines bind inside a render pass, compute ones outside.
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint) -> bool {
        match self {
            SlotState::Recording { in_render_pass: true, has_pipeline, .. }
                if bind_point == vk::PipelineBindPoint::GRAPHICS =>
            {
                *has_pipeline = true;
                true
            }
            SlotState::Recording { in_render_pass: false, has_compute, .. }
                if bind_point == vk::PipelineBindPoint::COMPUTE =>
            {
                *has_compute = true;
                true
            }
            _ => false,
        }
    }

    pub fn can_bind_set(&self, bind_point: vk::PipelineBindPoint) -> bool {
        match *self {
            SlotState::Recording { in_render_pass, has_pipeline, has_compute } => {
                if bind_point == vk::PipelineBindPoint::COMPUTE {
                    has_compute && !in_render_pass
                } else {
                    has_pipeline && in_render_pass
                }
            }
            _ => false,
        }
    }

    pub fn can_draw(&self) -> bool {
        matches!(self, SlotState::Recording { in_render_pass: true, has_pipeline: true, .. })
    }

    pub fn can_dispatch(&self) -> bool {
        matches!(self, SlotState::Recording { in_render_pass: false, has_compute: true, .. })
    }

    pub fn compile(&mut self) -> CompileAction {
        match *self {
            SlotState::Recording { in_render_pass, .. } => {
                *self = SlotState::Compiled;
                CompileAction::End { close_render_pass: in_render_pass }
            }
            _ => CompileAction::NotRecording,
        }
    }

    pub fn is_submittable(&self) -> bool {
        *self == SlotState::Compiled
    }

    pub fn mark_submitted(&mut self) {
        if *self == SlotState::Compiled {
            *self = SlotState::Submitted;
        }
    }

    /// The frame's fence was waited. Single-use slots need re-recording,
    /// persistent ones can be submitted again.
    pub fn retire(&mut self, single_use: bool) {
        match *self {
            SlotState::Submitted if single_use => *self = SlotState::Idle,
            SlotState::Submitted => *self = SlotState::Compiled,
            SlotState::Compiled if single_use => *self = SlotState::Idle,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GFX: vk::PipelineBindPoint = vk::PipelineBindPoint::GRAPHICS;
    const CMP: vk::PipelineBindPoint = vk::PipelineBindPoint::COMPUTE;

    // ============================================================
    // Guards
    // ============================================================

    #[test]
    fn test_idle_slot_rejects_everything() {
        let mut s = SlotState::Idle;
        assert!(!s.begin_render_pass());
        assert!(!s.end_render_pass());
        assert!(!s.bind_pipeline(GFX));
        assert!(!s.can_draw());
        assert!(!s.can_dispatch());
        assert!(!s.can_bind_set(GFX));
        assert_eq!(s.compile(), CompileAction::NotRecording);
        assert_eq!(s, SlotState::Idle);
    }

    #[test]
    fn test_draw_outside_render_pass_is_rejected() {
        let mut s = SlotState::Idle;
        s.init();
        assert!(!s.bind_pipeline(GFX));
        assert!(!s.can_draw());

        assert!(s.begin_render_pass());
        assert!(!s.can_draw());
        assert!(!s.can_bind_set(GFX));
        assert!(s.bind_pipeline(GFX));
        assert!(s.can_draw());
        assert!(s.can_bind_set(GFX));

        assert!(s.end_render_pass());
        assert!(!s.can_draw());
    }

    #[test]
    fn test_nested_render_pass_is_rejected() {
        let mut s = SlotState::Idle;
        s.init();
        assert!(s.begin_render_pass());
        assert!(!s.begin_render_pass());
        assert!(s.end_render_pass());
        assert!(!s.end_render_pass());
    }

    #[test]
    fn test_compute_binds_outside_render_pass_only() {
        let mut s = SlotState::Idle;
        s.init();
        assert!(!s.can_dispatch());
        assert!(s.bind_pipeline(CMP));
        assert!(s.can_dispatch());
        assert!(s.can_bind_set(CMP));

        s.begin_render_pass();
        assert!(!s.bind_pipeline(CMP));
        assert!(!s.can_dispatch());
    }

    #[test]
    fn test_render_pass_resets_graphics_pipeline() {
        let mut s = SlotState::Idle;
        s.init();
        s.begin_render_pass();
        s.bind_pipeline(GFX);
        s.end_render_pass();
        s.begin_render_pass();
        assert!(!s.can_draw());
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    #[test]
    fn test_init_on_open_recording_reports_implicit_compile() {
        let mut s = SlotState::Idle;
        assert_eq!(s.init(), InitAction::Begin);
        s.begin_render_pass();
        assert_eq!(s.init(), InitAction::ImplicitCompile { in_render_pass: true });
        assert_eq!(s, SlotState::RECORDING);
        assert_eq!(s.init(), InitAction::ImplicitCompile { in_render_pass: false });
    }

    #[test]
    fn test_compile_closes_open_render_pass() {
        let mut s = SlotState::Idle;
        s.init();
        s.begin_render_pass();
        assert_eq!(s.compile(), CompileAction::End { close_render_pass: true });
        assert!(s.is_submittable());
        assert_eq!(s.compile(), CompileAction::NotRecording);
    }

    #[test]
    fn test_retire_single_use_and_persistent() {
        let mut single = SlotState::Compiled;
        single.mark_submitted();
        assert_eq!(single, SlotState::Submitted);
        assert!(!single.is_submittable());
        single.retire(true);
        assert_eq!(single, SlotState::Idle);

        let mut persistent = SlotState::Compiled;
        persistent.mark_submitted();
        persistent.retire(false);
        assert!(persistent.is_submittable());

        // Compiled but never submitted: single-use content is stale next frame.
        let mut unused = SlotState::Compiled;
        unused.retire(true);
        assert_eq!(unused, SlotState::Idle);
    }

    #[test]
    fn test_mark_submitted_requires_compiled() {
        let mut s = SlotState::RECORDING;
        s.mark_submitted();
        assert!(s.is_recording());
    }
}
