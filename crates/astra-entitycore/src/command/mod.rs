//! Command recording and submission.

mod command_mgr;
mod event;
mod slot;
mod submission;

pub use command_mgr::{CommandMgr, FRAME_WAIT_TIMEOUT};
pub use event::{CmdEvent, CommandQueue, CommandRecorder};
pub use slot::{CompileAction, InitAction, SlotState};
pub use submission::{Batch, ResolvedBatch, SubmissionGraph, CHAIN_WAIT_STAGE};
