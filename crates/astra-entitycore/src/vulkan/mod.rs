//! Device, surface and memory ownership.
//!
//! `Vulkan` owns the instance/device/queues; `VirtualSurface` borrows it to
//! build the swapchain and per-frame targets; `MemoryManager` hands out
//! `SubMemory` leases for everything else.

pub mod context;
pub mod memory;
pub mod retire;
pub mod surface;

pub use context::{QueueFamilyIndices, QueueHandle, QueueTarget, Vulkan};
pub use memory::{GpuBuffer, GpuImage, MemoryManager, SubMemory};
pub use retire::{Deferred, RetireRing};
pub use surface::{FrameLink, RenderPassInfo, VirtualSurface};

use ash::vk;
use std::ffi::CStr;

pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

pub const APP_NAME: &CStr = c"Astra";

pub const ENGINE_NAME: &CStr = c"EntityCore";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);
