//! VirtualSurface: swapchain, per-frame render targets and present.
//!
//! Rendering never targets swapchain images directly. Each frame in flight
//! owns a color+depth target with a fixed framebuffer, so persistent command
//! buffers recorded once stay valid for the lifetime of the surface. The
//! last step of every frame is a blit from that frame's target into the
//! acquired swapchain image.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::{GpuImage, MemoryManager, Vulkan};
use crate::error::{CoreError, CoreResult};

/// Semaphores and tail work connecting one frame's submission chain to the
/// swapchain.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameLink {
    /// Waited by the first batch (null: no wait).
    pub top: vk::Semaphore,
    pub top_stage: vk::PipelineStageFlags,
    /// Signaled by the last batch (null: no signal).
    pub bottom: vk::Semaphore,
    /// Submitted as the final batch, after everything the caller scheduled.
    pub tail: Option<vk::CommandBuffer>,
}

impl FrameLink {
    /// No swapchain: nothing to wait for or signal.
    pub fn headless() -> Self {
        Self::default()
    }
}

/// Everything `CommandMgr::begin_render_pass` needs, one framebuffer per
/// frame in flight (or a single one shared by all frames).
#[derive(Clone)]
pub struct RenderPassInfo {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub clear_values: Vec<vk::ClearValue>,
}

impl RenderPassInfo {
    pub fn framebuffer(&self, frame: usize) -> vk::Framebuffer {
        match self.framebuffers.len() {
            0 => vk::Framebuffer::null(),
            1 => self.framebuffers[0],
            n => self.framebuffers[frame % n],
        }
    }
}

struct FrameTarget {
    color: GpuImage,
    depth: GpuImage,
    framebuffer: vk::Framebuffer,
}

struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

impl FrameSync {
    unsafe fn new(device: &ash::Device) -> CoreResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = device
            .create_semaphore(&semaphore_info, None)
            .map_err(|e| CoreError::vk("Failed to create semaphore", e))?;
        let render_finished = match device.create_semaphore(&semaphore_info, None) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(CoreError::vk("Failed to create semaphore", e));
            }
        };
        Ok(Self { image_available, render_finished })
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
    }
}

pub struct VirtualSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,

    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,

    /// Offscreen color format used by the render pass.
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub render_pass: vk::RenderPass,

    targets: Vec<FrameTarget>,
    sync: Vec<FrameSync>,
    /// Acquired swapchain image per frame in flight.
    image_index: Vec<u32>,

    blit_pool: vk::CommandPool,
    /// One present blit per (frame, swapchain image).
    blits: Vec<Vec<vk::CommandBuffer>>,
}

impl VirtualSurface {
    /// Create the surface, swapchain and `frames` render targets.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the surface.
    pub unsafe fn new(
        ctx: &Vulkan,
        memory: &MemoryManager,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        frames: usize,
    ) -> CoreResult<Self> {
        let handle = ash_window::create_surface(&ctx.entry, &ctx.instance, display_handle, window_handle, None)
            .map_err(|e| CoreError::vk("Failed to create Vulkan surface", e))?;

        let supported = ctx
            .surface_loader
            .get_physical_device_surface_support(ctx.physical_device, ctx.present.family, handle)
            .unwrap_or(false);
        if !supported {
            ctx.surface_loader.destroy_surface(handle, None);
            return Err(CoreError::Unsupported("present queue cannot present to this surface".into()));
        }

        let capabilities = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .map_err(|e| CoreError::vk("Failed to get surface capabilities", e))?;
        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .map_err(|e| CoreError::vk("Failed to get surface formats", e))?;
        let present_modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .map_err(|e| CoreError::vk("Failed to get present modes", e))?;

        let format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes, true);
        let color_format = vk::Format::R8G8B8A8_UNORM;
        let depth_format = ctx.find_depth_format();
        let render_pass = create_render_pass(&ctx.device, color_format, depth_format)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.graphics.family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let blit_pool = ctx
            .device
            .create_command_pool(&pool_info, None)
            .map_err(|e| CoreError::vk("Failed to create blit command pool", e))?;

        let mut sync = Vec::with_capacity(frames);
        for _ in 0..frames {
            sync.push(FrameSync::new(&ctx.device)?);
        }

        let mut surface = Self {
            handle,
            format,
            present_mode,
            capabilities,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            extent: vk::Extent2D { width, height },
            color_format,
            depth_format,
            render_pass,
            targets: Vec::new(),
            sync,
            image_index: vec![0; frames],
            blit_pool,
            blits: Vec::new(),
        };
        surface.build_swapchain(ctx, memory, width, height)?;
        Ok(surface)
    }

    pub fn frames(&self) -> usize {
        self.sync.len()
    }

    /// (Re)create swapchain, frame targets and blit commands for a size.
    unsafe fn build_swapchain(
        &mut self,
        ctx: &Vulkan,
        memory: &MemoryManager,
        width: u32,
        height: u32,
    ) -> CoreResult<()> {
        self.capabilities = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .map_err(|e| CoreError::vk("Failed to refresh surface capabilities", e))?;
        let extent = clamp_extent(&self.capabilities, width, height);

        let max_images = if self.capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            self.capabilities.max_image_count
        };
        let image_count = (self.capabilities.min_image_count + 1).min(max_images);

        let old = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.handle)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(self.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old);

        self.swapchain = ctx
            .swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| CoreError::vk("Failed to create swapchain", e))?;
        if old != vk::SwapchainKHR::null() {
            ctx.swapchain_loader.destroy_swapchain(old, None);
        }

        self.images = ctx
            .swapchain_loader
            .get_swapchain_images(self.swapchain)
            .map_err(|e| CoreError::vk("Failed to get swapchain images", e))?;
        self.extent = extent;

        self.destroy_targets(ctx);
        for i in 0..self.frames() {
            let color = memory.create_render_target(
                extent.width,
                extent.height,
                self.color_format,
                &format!("frame target {}", i),
            )?;
            let depth = memory.create_depth_buffer(
                extent.width,
                extent.height,
                self.depth_format,
                &format!("frame depth {}", i),
            )?;
            let attachments = [color.view, depth.view];
            let fb_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = ctx
                .device
                .create_framebuffer(&fb_info, None)
                .map_err(|e| CoreError::vk("Failed to create framebuffer", e))?;
            self.targets.push(FrameTarget { color, depth, framebuffer });
        }

        self.record_blits(ctx)?;
        self.init_target_layouts(ctx)
    }

    /// Put every frame target in TRANSFER_SRC layout so a frame that draws
    /// nothing still presents a defined image.
    unsafe fn init_target_layouts(&self, ctx: &Vulkan) -> CoreResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.blit_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = ctx
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| CoreError::vk("Failed to allocate command buffer", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        ctx.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| CoreError::vk("Failed to begin command buffer", e))?;
        let barriers: Vec<_> = self
            .targets
            .iter()
            .map(|t| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(t.color.handle)
                    .subresource_range(t.color.full_range())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            })
            .collect();
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );
        ctx.device
            .end_command_buffer(cmd)
            .map_err(|e| CoreError::vk("Failed to end command buffer", e))?;

        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        ctx.graphics
            .submit(&ctx.device, &[submit], vk::Fence::null())
            .map_err(|e| CoreError::vk("Failed to submit layout init", e))?;
        ctx.graphics
            .wait_idle(&ctx.device)
            .map_err(|e| CoreError::vk("Failed to wait for queue", e))?;
        ctx.device.free_command_buffers(self.blit_pool, &cmds);
        Ok(())
    }

    /// Record the present blit for every (frame target, swapchain image).
    unsafe fn record_blits(&mut self, ctx: &Vulkan) -> CoreResult<()> {
        for per_frame in self.blits.drain(..) {
            if !per_frame.is_empty() {
                ctx.device.free_command_buffers(self.blit_pool, &per_frame);
            }
        }

        let count = self.images.len() as u32;
        for target in &self.targets {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.blit_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(count);
            let cmds = ctx
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| CoreError::vk("Failed to allocate blit command buffers", e))?;

            for (&cmd, &image) in cmds.iter().zip(&self.images) {
                record_blit(&ctx.device, cmd, target.color.handle, image, self.extent)?;
            }
            self.blits.push(cmds);
        }
        Ok(())
    }

    unsafe fn destroy_targets(&mut self, ctx: &Vulkan) {
        for target in self.targets.drain(..) {
            ctx.device.destroy_framebuffer(target.framebuffer, None);
            drop(target.color);
            drop(target.depth);
        }
    }

    /// Acquire the swapchain image for `frame`.
    ///
    /// Returns `Ok(false)` when the swapchain is out of date and must be
    /// recreated before rendering.
    pub unsafe fn acquire(&mut self, ctx: &Vulkan, frame: usize) -> CoreResult<bool> {
        let result = ctx.swapchain_loader.acquire_next_image(
            self.swapchain,
            u64::MAX,
            self.sync[frame].image_available,
            vk::Fence::null(),
        );
        match result {
            Ok((index, _suboptimal)) => {
                self.image_index[frame] = index;
                Ok(true)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(CoreError::vk("Failed to acquire swapchain image", e)),
        }
    }

    /// Semaphores and present blit for `frame`, to hand to
    /// `CommandMgr::submit`.
    pub fn frame_link(&self, frame: usize) -> FrameLink {
        let image = self.image_index[frame] as usize;
        FrameLink {
            top: self.sync[frame].image_available,
            top_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
            bottom: self.sync[frame].render_finished,
            tail: self.blits.get(frame).and_then(|b| b.get(image)).copied(),
        }
    }

    /// Present `frame`'s acquired image. `Ok(false)` means recreate.
    pub unsafe fn present(&mut self, ctx: &Vulkan, frame: usize) -> CoreResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [self.image_index[frame]];
        let wait_semaphores = [self.sync[frame].render_finished];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = ctx.present.present(&ctx.swapchain_loader, &present_info);
        match result {
            Ok(false) => Ok(true),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(CoreError::vk("Failed to present", e)),
        }
    }

    /// Render pass description for drawing into the frame targets.
    pub fn render_pass_info(&self, clear_color: [f32; 4]) -> RenderPassInfo {
        RenderPassInfo {
            render_pass: self.render_pass,
            framebuffers: self.targets.iter().map(|t| t.framebuffer).collect(),
            extent: self.extent,
            clear_values: vec![
                vk::ClearValue { color: vk::ClearColorValue { float32: clear_color } },
                vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
            ],
        }
    }

    /// The color image rendered for `frame` (e.g. for screenshots).
    pub fn frame_color(&self, frame: usize) -> Option<&GpuImage> {
        self.targets.get(frame).map(|t| &t.color)
    }

    /// Rebuild everything size-dependent. Persistent command buffers that
    /// reference the old framebuffers must be re-recorded by the caller.
    ///
    /// Also the way back from a frame `CommandMgr::submit` abandoned half
    /// way: the old swapchain takes the unpresented image with it and every
    /// frame gets fresh, unsignalled semaphores.
    pub unsafe fn recreate(&mut self, ctx: &Vulkan, memory: &MemoryManager, width: u32, height: u32) -> CoreResult<()> {
        ctx.wait_idle();
        for sync in &mut self.sync {
            let fresh = FrameSync::new(&ctx.device)?;
            std::mem::replace(sync, fresh).destroy(&ctx.device);
        }
        self.build_swapchain(ctx, memory, width, height)
    }

    pub unsafe fn destroy(&mut self, ctx: &Vulkan) {
        ctx.wait_idle();
        self.destroy_targets(ctx);
        ctx.device.destroy_command_pool(self.blit_pool, None);
        self.blits.clear();
        for sync in self.sync.drain(..) {
            sync.destroy(&ctx.device);
        }
        ctx.device.destroy_render_pass(self.render_pass, None);
        ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
        ctx.surface_loader.destroy_surface(self.handle, None);
        self.swapchain = vk::SwapchainKHR::null();
        self.handle = vk::SurfaceKHR::null();
    }
}

unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> CoreResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];
    let color_ref = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref)];
    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::TRANSFER)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ),
    ];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    device
        .create_render_pass(&info, None)
        .map_err(|e| CoreError::vk("Failed to create render pass", e))
}

unsafe fn record_blit(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
) -> CoreResult<()> {
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };

    device
        .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
        .map_err(|e| CoreError::vk("Failed to begin blit command buffer", e))?;

    let to_dst = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst)
        .subresource_range(range)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_dst],
    );

    let corner = vk::Offset3D { x: extent.width as i32, y: extent.height as i32, z: 1 };
    let blit = vk::ImageBlit::default()
        .src_subresource(layers)
        .src_offsets([vk::Offset3D::default(), corner])
        .dst_subresource(layers)
        .dst_offsets([vk::Offset3D::default(), corner]);
    device.cmd_blit_image(
        cmd,
        src,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        dst,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[blit],
        vk::Filter::NEAREST,
    );

    let to_present = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst)
        .subresource_range(range)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_present],
    );

    device
        .end_command_buffer(cmd)
        .map_err(|e| CoreError::vk("Failed to end blit command buffer", e))
}

/// Prefer SRGB B8G8R8A8, then UNORM B8G8R8A8, then whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.iter().find(|f| f.format == vk::Format::B8G8R8A8_UNORM))
        .or_else(|| formats.first())
        .copied()
        .unwrap_or(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is guaranteed to be available
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Current extent if the surface defines one, else the desired size clamped.
fn clamp_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_choose_surface_format() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert_eq!(choose_surface_format(&[other, unorm, srgb]).format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(choose_surface_format(&[other, unorm]).format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(choose_surface_format(&[other]).format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(choose_surface_format(&[]).format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_clamp_extent() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 16, height: 16 },
            max_image_extent: vk::Extent2D { width: 1024, height: 1024 },
            ..Default::default()
        };
        assert_eq!(clamp_extent(&caps, 4000, 8), vk::Extent2D { width: 1024, height: 16 });
        caps.current_extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(clamp_extent(&caps, 4000, 8), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_render_pass_info_framebuffer_per_frame() {
        let fbs: Vec<_> = (1..=3).map(vk::Framebuffer::from_raw).collect();
        let info = RenderPassInfo {
            render_pass: vk::RenderPass::from_raw(9),
            framebuffers: fbs.clone(),
            extent: vk::Extent2D { width: 1, height: 1 },
            clear_values: vec![],
        };
        assert_eq!(info.framebuffer(0), fbs[0]);
        assert_eq!(info.framebuffer(4), fbs[1]);

        let shared = RenderPassInfo { framebuffers: vec![fbs[2]], ..info.clone() };
        assert_eq!(shared.framebuffer(2), fbs[2]);
        let none = RenderPassInfo { framebuffers: vec![], ..info };
        assert_eq!(none.framebuffer(0), vk::Framebuffer::null());
    }

    #[test]
    fn test_headless_link_is_empty() {
        let link = FrameLink::headless();
        assert_eq!(link.top, vk::Semaphore::null());
        assert_eq!(link.bottom, vk::Semaphore::null());
        assert!(link.tail.is_none());
    }
}
