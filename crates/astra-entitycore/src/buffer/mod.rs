//! Sub-allocated GPU buffers: the region allocator, the pooled `BufferMgr`,
//! and the typed vertex/index/uniform buffers built on it.

pub mod buffer_mgr;
pub mod region;
pub mod uniform;
pub mod vertex;

pub use buffer_mgr::{BufferKind, BufferMgr, BufferStats, SubAllocator, SubBuffer};
pub use region::{Region, RegionAllocator, RegionError};
pub use uniform::Uniform;
pub use vertex::{BufferAccess, BufferType, IndexBuffer, VertexArray, VertexBuffer, VertexLayout, VertexView};
