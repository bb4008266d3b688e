//! Vulkan context: instance, physical device, logical device, and queues.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use parking_lot::Mutex;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::error::{CoreError, CoreResult};

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
    pub compute: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Which queue a submission batch runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueTarget {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

/// A device queue plus the lock that serializes `vkQueueSubmit` on it.
///
/// Queues of the same family share one lock, so a fallback (e.g. transfer
/// work on the graphics queue) stays externally synchronized.
#[derive(Clone)]
pub struct QueueHandle {
    pub queue: vk::Queue,
    pub family: u32,
    lock: Arc<Mutex<()>>,
}

impl QueueHandle {
    pub fn new(queue: vk::Queue, family: u32) -> Self {
        Self { queue, family, lock: Arc::new(Mutex::new(())) }
    }

    /// Another queue handle sharing this one's lock.
    fn alias(&self) -> Self {
        self.clone()
    }

    pub unsafe fn submit(
        &self,
        device: &Device,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let _guard = self.lock.lock();
        device.queue_submit(self.queue, submits, fence)
    }

    /// Present on this queue. `Ok(true)` means the swapchain is suboptimal.
    pub unsafe fn present(
        &self,
        loader: &swapchain::Device,
        info: &vk::PresentInfoKHR,
    ) -> Result<bool, vk::Result> {
        let _guard = self.lock.lock();
        loader.queue_present(self.queue, info)
    }

    pub unsafe fn wait_idle(&self, device: &Device) -> Result<(), vk::Result> {
        let _guard = self.lock.lock();
        device.queue_wait_idle(self.queue)
    }
}

/// Top-level device owner. Every other component borrows it (`&Vulkan`) or
/// clones the `ash::Device` it needs.
pub struct Vulkan {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,

    pub graphics: QueueHandle,
    pub present: QueueHandle,
    /// Dedicated transfer queue, or an alias of `graphics`.
    pub transfer: QueueHandle,
    /// Dedicated compute queue, or an alias of `graphics`.
    pub compute: QueueHandle,

    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,

    pub device_properties: vk::PhysicalDeviceProperties,
    pub device_features: vk::PhysicalDeviceFeatures,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl Vulkan {
    /// Create the Vulkan context.
    ///
    /// With no display handle the instance is created without surface
    /// extensions (offscreen/compute use).
    pub unsafe fn new(
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> CoreResult<Self> {
        let entry = Entry::load().map_err(|e| CoreError::Loading(e.to_string()))?;

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(|e| CoreError::vk("Failed to enumerate instance version", e))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(CoreError::Unsupported(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            Self::setup_debug_messenger(&entry, &instance)?
        } else {
            (None, None)
        };

        let surface_loader = surface::Instance::new(&entry, &instance);

        let (physical_device, queue_families) = Self::pick_physical_device(&instance)?;
        let device_properties = instance.get_physical_device_properties(physical_device);
        let device_features = instance.get_physical_device_features(physical_device);

        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            &device_features,
            display_handle.is_some(),
        )?;

        let graphics_family = queue_families
            .graphics
            .ok_or_else(|| CoreError::Unsupported("no graphics queue family".into()))?;
        let graphics = QueueHandle::new(device.get_device_queue(graphics_family, 0), graphics_family);
        let present = match queue_families.present {
            Some(f) if f != graphics_family => QueueHandle::new(device.get_device_queue(f, 0), f),
            _ => graphics.alias(),
        };
        let transfer = match queue_families.transfer {
            Some(f) => QueueHandle::new(device.get_device_queue(f, 0), f),
            None => graphics.alias(),
        };
        let compute = match queue_families.compute {
            Some(f) => QueueHandle::new(device.get_device_queue(f, 0), f),
            None => graphics.alias(),
        };

        let swapchain_loader = swapchain::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            graphics,
            present,
            transfer,
            compute,
            surface_loader,
            swapchain_loader,
            device_properties,
            device_features,
            debug_utils_loader,
            debug_messenger,
        })
    }

    unsafe fn create_instance(
        entry: &Entry,
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> CoreResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = match display_handle {
            Some(handle) => ash_window::enumerate_required_extensions(handle)
                .map_err(|e| CoreError::vk("Failed to get required extensions", e))?
                .to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| CoreError::vk("Failed to create Vulkan instance", e))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> CoreResult<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| CoreError::vk("Failed to create debug messenger", e))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    unsafe fn pick_physical_device(instance: &Instance) -> CoreResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| CoreError::vk("Failed to enumerate physical devices", e))?;

        let best = devices
            .iter()
            .map(|&device| (device, Self::rate_device(instance, device)))
            .filter(|&(_, score)| score > 0)
            .max_by_key(|&(_, score)| score)
            .map(|(device, _)| device)
            .ok_or_else(|| CoreError::Unsupported("no suitable GPU found".into()))?;

        let queue_families = Self::find_queue_families(instance, best);

        let props = instance.get_physical_device_properties(best);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (transfer queue: {}, compute queue: {})",
            name,
            if queue_families.transfer.is_some() { "dedicated" } else { "shared" },
            if queue_families.compute.is_some() { "dedicated" } else { "shared" },
        );

        Ok((best, queue_families))
    }

    /// Rate a physical device (higher is better, 0 is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        let props = instance.get_physical_device_properties(device);
        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }
        if Self::find_queue_families(instance, device).graphics.is_none() {
            return 0;
        }

        let mut score = 1u32;
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += (heap.size / (1024 * 1024)) as u32;
            }
        }
        score
    }

    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let families = instance.get_physical_device_queue_family_properties(device);
        select_queue_families(&families.iter().map(|f| f.queue_flags).collect::<Vec<_>>())
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        available: &vk::PhysicalDeviceFeatures,
        with_swapchain: bool,
    ) -> CoreResult<Device> {
        let mut unique_families: Vec<u32> = Vec::new();
        for family in [
            queue_families.graphics,
            queue_families.present,
            queue_families.transfer,
            queue_families.compute,
        ]
        .into_iter()
        .flatten()
        {
            if !unique_families.contains(&family) {
                unique_families.push(family);
            }
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut extensions: Vec<*const c_char> = Vec::new();
        if with_swapchain {
            extensions.push(swapchain::NAME.as_ptr());
        }

        let device_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(available.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(available.fill_mode_non_solid == vk::TRUE)
            .wide_lines(available.wide_lines == vk::TRUE)
            .multi_draw_indirect(available.multi_draw_indirect == vk::TRUE)
            .draw_indirect_first_instance(available.draw_indirect_first_instance == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&device_features);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| CoreError::vk("Failed to create logical device", e))
    }

    pub fn queue(&self, target: QueueTarget) -> &QueueHandle {
        match target {
            QueueTarget::Graphics => &self.graphics,
            QueueTarget::Compute => &self.compute,
            QueueTarget::Transfer => &self.transfer,
        }
    }

    /// Alignment every uniform sub-buffer offset must respect.
    pub fn uniform_alignment(&self) -> u64 {
        self.device_properties.limits.min_uniform_buffer_offset_alignment.max(4)
    }

    pub fn max_anisotropy(&self) -> f32 {
        if self.device_features.sampler_anisotropy == vk::TRUE {
            self.device_properties.limits.max_sampler_anisotropy
        } else {
            1.0
        }
    }

    /// First depth format the device supports as an optimal-tiling attachment.
    pub unsafe fn find_depth_format(&self) -> vk::Format {
        for format in [vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT, vk::Format::D16_UNORM] {
            let props = self
                .instance
                .get_physical_device_format_properties(self.physical_device, format);
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return format;
            }
        }
        vk::Format::D16_UNORM
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for Vulkan {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Pick queue families from their capability flags: the first graphics
/// family (which also presents), and families that can transfer or compute
/// without graphics as dedicated queues.
pub fn select_queue_families(flags: &[vk::QueueFlags]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    for (i, family) in flags.iter().enumerate() {
        let i = i as u32;
        let graphics = family.contains(vk::QueueFlags::GRAPHICS);

        if graphics && indices.graphics.is_none() {
            indices.graphics = Some(i);
            indices.present = Some(i);
        }
        if !graphics && family.contains(vk::QueueFlags::TRANSFER) && !family.contains(vk::QueueFlags::COMPUTE) {
            // A transfer-only family is the best upload queue.
            indices.transfer = Some(i);
        } else if !graphics && family.contains(vk::QueueFlags::TRANSFER) && indices.transfer.is_none() {
            indices.transfer = Some(i);
        }
        if !graphics && family.contains(vk::QueueFlags::COMPUTE) && indices.compute.is_none() {
            indices.compute = Some(i);
        }
    }
    indices
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK] {}", message);
    }

    vk::FALSE
}
