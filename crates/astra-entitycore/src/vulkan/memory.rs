//! Device memory management on top of gpu-allocator.
//!
//! Every allocation is a `SubMemory`: a lease on a region of one of the
//! allocator's memory blocks. The lease frees itself on drop, so buffers and
//! images built from it clean up in the right order (handle first, then
//! memory) without any explicit destroy call.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::Vulkan;
use crate::error::{CoreError, CoreResult};

/// A lease on a region of device memory.
pub struct SubMemory {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// Memory class the region was carved from; the allocator keeps one set
    /// of blocks per class.
    pub location: MemoryLocation,
    allocation: Option<Allocation>,
    allocator: Arc<Mutex<Allocator>>,
}

impl SubMemory {
    /// Host pointer to the start of the region, for host-visible memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.cast::<u8>())
    }
}

impl Drop for SubMemory {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free device memory: {:?}", e);
            }
        }
    }
}

/// Host-visible pointer that may cross threads. Writers own disjoint byte
/// ranges, handed out by the sub-allocators.
#[derive(Clone, Copy)]
pub struct MappedPtr(pub NonNull<u8>);

// SAFETY: the pointer targets persistently mapped device memory that lives
// as long as its owning buffer; range exclusivity is enforced by allocation.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// GPU buffer with its memory lease.
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: SubMemory,
    device: ash::Device,
}

impl GpuBuffer {
    pub fn mapped(&self) -> Option<MappedPtr> {
        self.memory.mapped_ptr().map(MappedPtr)
    }

    /// Copy bytes into a host-visible buffer at `offset`. Returns false when
    /// the buffer is not mapped or the write would overflow it.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> bool {
        let Some(ptr) = self.mapped() else {
            return false;
        };
        if offset + data.len() as u64 > self.size {
            return false;
        }
        // SAFETY: bounds checked above; the mapping covers `size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.0.as_ptr().add(offset as usize), data.len());
        }
        true
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
        }
    }
}

/// GPU image with one view over all of its mips, plus its memory lease.
pub struct GpuImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub memory: SubMemory,
    device: ash::Device,
}

impl GpuImage {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.handle, None);
        }
    }
}

/// Image aspect implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Number of mip levels down to 1×1.
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    pub unsafe fn new(ctx: &Vulkan) -> CoreResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| CoreError::Allocation { name: "allocator".into(), message: e.to_string() })?;

        Ok(Self { allocator: Arc::new(Mutex::new(allocator)), device: ctx.device.clone() })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Carve a region out of the allocator's blocks for `location`.
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> CoreResult<SubMemory> {
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                log::error!("Out of device memory for {} ({} bytes): {}", name, requirements.size, e);
                CoreError::Allocation { name: name.to_string(), message: e.to_string() }
            })?;

        // SAFETY: the allocation stays alive inside the SubMemory.
        let memory = unsafe { allocation.memory() };
        Ok(SubMemory {
            memory,
            offset: allocation.offset(),
            size: allocation.size(),
            location,
            allocation: Some(allocation),
            allocator: self.allocator.clone(),
        })
    }

    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> CoreResult<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| CoreError::vk("Failed to create buffer", e))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);
        let memory = match self.allocate(name, requirements, location, true) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e);
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, memory.memory, memory.offset) {
            self.device.destroy_buffer(handle, None);
            return Err(CoreError::vk("Failed to bind buffer memory", e));
        }

        Ok(GpuBuffer { handle, size, usage, memory, device: self.device.clone() })
    }

    /// CPU-visible transfer source.
    pub unsafe fn create_staging_buffer(&self, size: vk::DeviceSize, name: &str) -> CoreResult<GpuBuffer> {
        self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu, name)
    }

    pub unsafe fn create_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        array_layers: u32,
        name: &str,
    ) -> CoreResult<GpuImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self
            .device
            .create_image(&image_info, None)
            .map_err(|e| CoreError::vk("Failed to create image", e))?;

        let requirements = self.device.get_image_memory_requirements(handle);
        let memory = match self.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e);
            }
        };

        if let Err(e) = self.device.bind_image_memory(handle, memory.memory, memory.offset) {
            self.device.destroy_image(handle, None);
            return Err(CoreError::vk("Failed to bind image memory", e));
        }

        let view_type = if array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(view_type)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: array_layers,
            });

        let view = match self.device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(CoreError::vk("Failed to create image view", e));
            }
        };

        Ok(GpuImage {
            handle,
            view,
            format,
            extent,
            mip_levels,
            array_layers,
            memory,
            device: self.device.clone(),
        })
    }

    /// Sampled 2D texture, written by transfer.
    pub unsafe fn create_texture_2d(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        mip_levels: u32,
        extra_usage: vk::ImageUsageFlags,
        name: &str,
    ) -> CoreResult<GpuImage> {
        self.create_image(
            vk::Extent3D { width, height, depth: 1 },
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | extra_usage,
            mip_levels,
            1,
            name,
        )
    }

    /// Color attachment that can also be blitted from.
    pub unsafe fn create_render_target(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        name: &str,
    ) -> CoreResult<GpuImage> {
        self.create_image(
            vk::Extent3D { width, height, depth: 1 },
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
            1,
            1,
            name,
        )
    }

    pub unsafe fn create_depth_buffer(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        name: &str,
    ) -> CoreResult<GpuImage> {
        self.create_image(
            vk::Extent3D { width, height, depth: 1 },
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            1,
            1,
            name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_for_format() {
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(0, 0), 1);
        assert_eq!(full_mip_count(2, 1), 2);
        assert_eq!(full_mip_count(256, 256), 9);
        assert_eq!(full_mip_count(8192, 4096), 14);
        assert_eq!(full_mip_count(300, 5), 9);
    }
}
