#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
// EntityCore: command submission and GPU resource lifetime on Vulkan 1.2

// Device, surface and memory
pub mod vulkan;

// Resources
pub mod buffer;
pub mod descriptor;
pub mod pipeline;
pub mod texture;
pub mod model;

// Recording and submission
pub mod command;

pub mod config;
pub mod error;
pub mod registry;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use registry::GraphicsResourceRegistry;
