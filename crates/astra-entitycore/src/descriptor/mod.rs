//! Descriptor pools and sets.

pub mod set;
pub mod set_mgr;

pub use set::{PendingWrite, Set};
pub use set_mgr::SetMgr;
