//! Background big-texture loader.
//!
//! The main thread queues `LoadRequest`s on a bounded channel. One worker
//! thread decodes each image (or reads its cached mip chain), finds it a
//! big-texture slot, uploads it through a `TextureUploader` and reports the
//! outcome on a lock-free queue. The main thread then records the
//! graphics-side ownership barrier and marks the slot ready.
//!
//! With a dedicated transfer queue the upload ends with a queue-family
//! release barrier; the matching acquire barrier comes from
//! `acquire_barrier`.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use crossbeam::channel::{self, Sender, TrySendError};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use super::big_texture::{Acquire, BigTexturePool};
use super::cache::TextureCache;
use super::image_data::ImageData;
use crate::error::{CoreError, CoreResult};
use crate::vulkan::{GpuBuffer, GpuImage, MemoryManager, QueueHandle};

pub type SharedPool<I> = Arc<Mutex<BigTexturePool<Arc<I>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub name: String,
    pub path: PathBuf,
    pub max_resolution: u32,
    pub mipmap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    Ready { name: String },
    Failed { name: String },
}

impl LoadResult {
    pub fn name(&self) -> &str {
        match self {
            LoadResult::Ready { name } | LoadResult::Failed { name } => name,
        }
    }
}

/// Creates slot images and fills them. Runs on the loader thread.
pub trait TextureUploader: Send + 'static {
    type Image: Send + Sync + 'static;

    fn create_image(&mut self, name: &str, width: u32, height: u32, levels: u32) -> CoreResult<Self::Image>;

    /// Upload every level of `mips` into `image`. On return the pixels are
    /// on the device, or the upload was abandoned and an error returned. An
    /// abandoned upload that may still be running keeps its own reference to
    /// `image`, so the caller may drop theirs.
    fn upload(&mut self, image: &Arc<Self::Image>, mips: &[ImageData]) -> CoreResult<()>;
}

fn load_mips(cache: &Mutex<TextureCache>, request: &LoadRequest) -> CoreResult<Vec<ImageData>> {
    if let Some(mut mips) = cache.lock().quick_load(&request.name, &request.path) {
        if mips[0].width.max(mips[0].height) <= request.max_resolution {
            if !request.mipmap {
                mips.truncate(1);
            }
            return Ok(mips);
        }
    }

    let base = ImageData::decode_file(&request.path, request.max_resolution)?;
    if !request.mipmap {
        return Ok(vec![base]);
    }
    let mips = base.mip_chain();

    let mut cache = cache.lock();
    let stored = cache.store(&request.name, &request.path, &mips);
    if let Err(e) = stored.and_then(|_| cache.save()) {
        log::warn!("{}: couldn't write texture cache: {}", request.name, e);
    }
    Ok(mips)
}

/// Load one request to completion.
pub fn process_request<U: TextureUploader>(
    uploader: &mut U,
    pool: &SharedPool<U::Image>,
    cache: &Mutex<TextureCache>,
    request: &LoadRequest,
) -> LoadResult {
    let name = request.name.clone();
    let mips = match load_mips(cache, request) {
        Ok(mips) => mips,
        Err(e) => {
            log::error!("{}: big texture load failed: {}", name, e);
            return LoadResult::Failed { name };
        }
    };
    let (width, height, levels) = (mips[0].width, mips[0].height, mips.len() as u32);

    let existing = {
        let mut pool = pool.lock();
        match pool.acquire(&name, width, height, levels) {
            Acquire::Hit(index) | Acquire::Reuse(index) => pool.slot_mut(index).map(|slot| {
                slot.loading = true;
                slot.ready = false;
                slot.image.clone()
            }),
            Acquire::NeedsNew => None,
        }
    };

    let image = match existing {
        Some(image) => image,
        None => {
            let image = match uploader.create_image(&name, width, height, levels) {
                Ok(image) => Arc::new(image),
                Err(e) => {
                    log::error!("{}: no big texture slot ({}x{}): {}", name, width, height, e);
                    return LoadResult::Failed { name };
                }
            };
            let mut pool = pool.lock();
            let index = pool.insert(&name, width, height, levels, image.clone());
            if let Some(slot) = pool.slot_mut(index) {
                slot.loading = true;
            }
            image
        }
    };

    let uploaded = uploader.upload(&image, &mips);

    let mut pool = pool.lock();
    if let Some(index) = pool.find(&name) {
        if let Some(slot) = pool.slot_mut(index) {
            slot.loading = false;
        }
    }
    match uploaded {
        Ok(()) => LoadResult::Ready { name },
        Err(e) => {
            log::error!("{}: upload abandoned: {}", name, e);
            LoadResult::Failed { name }
        }
    }
}

pub struct LoaderWorker {
    tx: Option<Sender<LoadRequest>>,
    ready: Arc<SegQueue<LoadResult>>,
    thread: Option<JoinHandle<()>>,
}

impl LoaderWorker {
    pub fn spawn<U: TextureUploader>(
        uploader: U,
        pool: SharedPool<U::Image>,
        cache: Arc<Mutex<TextureCache>>,
        capacity: usize,
    ) -> CoreResult<Self> {
        let (tx, rx) = channel::bounded::<LoadRequest>(capacity.max(1));
        let ready = Arc::new(SegQueue::new());
        let results = ready.clone();

        let thread = std::thread::Builder::new()
            .name("big-texture-loader".into())
            .spawn(move || {
                let mut uploader = uploader;
                for request in rx.iter() {
                    results.push(process_request(&mut uploader, &pool, &cache, &request));
                }
                log::debug!("Big texture loader stopped");
            })
            .map_err(|e| CoreError::io("big-texture-loader", e))?;

        Ok(Self { tx: Some(tx), ready, thread: Some(thread) })
    }

    /// Queue a request. False when the queue is full (try again next frame)
    /// or the worker is gone.
    pub fn request(&self, request: LoadRequest) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                log::debug!("Big texture queue full, {} deferred", request.name);
                false
            }
            Err(TrySendError::Disconnected(request)) => {
                log::error!("Big texture loader is gone, {} dropped", request.name);
                false
            }
        }
    }

    pub fn pop_ready(&self) -> Option<LoadResult> {
        self.ready.pop()
    }

    /// Finish queued requests and stop the thread.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Big texture loader panicked");
            }
        }
    }
}

impl Drop for LoaderWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================
// Transfer-queue uploader
// ============================================================

fn color_range(levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: levels,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Copy regions for tightly packed mips laid out back to back.
pub fn mip_copy_regions(mips: &[ImageData]) -> (Vec<vk::BufferImageCopy>, u64) {
    let mut offset = 0u64;
    let regions = mips
        .iter()
        .enumerate()
        .map(|(level, mip)| {
            let region = vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level as u32,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D { width: mip.width, height: mip.height, depth: 1 },
            };
            offset += mip.byte_len() as u64;
            region
        })
        .collect();
    (regions, offset)
}

/// Barrier ending an upload: to shader-read layout, and released to
/// `dst_family` when it differs from `src_family`.
pub fn release_barrier(
    image: vk::Image,
    levels: u32,
    src_family: u32,
    dst_family: u32,
) -> (vk::ImageMemoryBarrier<'static>, vk::PipelineStageFlags) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .image(image)
        .subresource_range(color_range(levels));
    if src_family == dst_family {
        let barrier = barrier
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
        (barrier, vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER)
    } else {
        let barrier = barrier
            .dst_access_mask(vk::AccessFlags::empty())
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family);
        (barrier, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
    }
}

/// The graphics-side half of a queue-family transfer. `None` when no
/// ownership transfer happened.
pub fn acquire_barrier(
    image: vk::Image,
    levels: u32,
    src_family: u32,
    dst_family: u32,
) -> Option<vk::ImageMemoryBarrier<'static>> {
    (src_family != dst_family).then(|| {
        vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(image)
            .subresource_range(color_range(levels))
    })
}

/// Uploads through a staging buffer on one queue and waits for each upload
/// with a timeout.
pub struct TransferUploader {
    memory: Arc<MemoryManager>,
    device: ash::Device,
    queue: QueueHandle,
    dst_family: u32,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    timeout: Duration,
    pending: bool,
    /// Staging buffers and target images of uploads that timed out; freed
    /// once the fence finally signals.
    stalled: Vec<(GpuBuffer, Arc<GpuImage>)>,
}

impl TransferUploader {
    /// `dst_family` is the queue family that samples the textures.
    pub unsafe fn new(
        device: &ash::Device,
        memory: Arc<MemoryManager>,
        queue: QueueHandle,
        dst_family: u32,
        timeout: Duration,
    ) -> CoreResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = device
            .create_command_pool(&pool_info, None)
            .map_err(|e| CoreError::vk("Failed to create upload command pool", e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = match device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers[0],
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(CoreError::vk("Failed to allocate upload command buffer", e));
            }
        };
        let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(CoreError::vk("Failed to create upload fence", e));
            }
        };

        Ok(Self {
            memory,
            device: device.clone(),
            queue,
            dst_family,
            pool,
            cmd,
            fence,
            timeout,
            pending: false,
            stalled: Vec::new(),
        })
    }

    pub fn src_family(&self) -> u32 {
        self.queue.family
    }

    pub fn dst_family(&self) -> u32 {
        self.dst_family
    }

    unsafe fn wait(&mut self) -> CoreResult<()> {
        if !self.pending {
            return Ok(());
        }
        let nanos = self.timeout.as_nanos().min(u64::MAX as u128) as u64;
        match self.device.wait_for_fences(&[self.fence], true, nanos) {
            Ok(()) => {
                self.device
                    .reset_fences(&[self.fence])
                    .map_err(|e| CoreError::vk("Failed to reset upload fence", e))?;
                self.pending = false;
                self.stalled.clear();
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => {
                Err(CoreError::Timeout { waited: self.timeout, what: "texture upload fence".into() })
            }
            Err(e) => Err(CoreError::vk("Failed to wait for upload fence", e)),
        }
    }

    unsafe fn record(&self, image: &GpuImage, regions: &[vk::BufferImageCopy], staging: vk::Buffer) -> CoreResult<()> {
        let device = &self.device;
        device
            .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
            .map_err(|e| CoreError::vk("Failed to reset upload command buffer", e))?;
        let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(self.cmd, &begin)
            .map_err(|e| CoreError::vk("Failed to begin upload command buffer", e))?;

        let to_transfer = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle)
            .subresource_range(color_range(image.mip_levels));
        device.cmd_pipeline_barrier(
            self.cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        device.cmd_copy_buffer_to_image(
            self.cmd,
            staging,
            image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
        );

        let (release, dst_stage) = release_barrier(image.handle, image.mip_levels, self.queue.family, self.dst_family);
        device.cmd_pipeline_barrier(
            self.cmd,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[release],
        );

        device
            .end_command_buffer(self.cmd)
            .map_err(|e| CoreError::vk("Failed to end upload command buffer", e))
    }
}

impl TextureUploader for TransferUploader {
    type Image = GpuImage;

    fn create_image(&mut self, name: &str, width: u32, height: u32, levels: u32) -> CoreResult<GpuImage> {
        unsafe {
            self.memory.create_texture_2d(
                width,
                height,
                vk::Format::R8G8B8A8_UNORM,
                levels,
                vk::ImageUsageFlags::empty(),
                name,
            )
        }
    }

    fn upload(&mut self, image: &Arc<GpuImage>, mips: &[ImageData]) -> CoreResult<()> {
        if mips.len() as u32 > image.mip_levels {
            return Err(CoreError::Misuse(format!("{} mips for a {}-level image", mips.len(), image.mip_levels)));
        }
        // SAFETY: the command buffer and fence are only used from this
        // uploader, and the previous upload is waited before reuse.
        unsafe {
            self.wait()?;

            let (regions, total) = mip_copy_regions(mips);
            let staging = self.memory.create_staging_buffer(total, "texture staging")?;
            for (region, mip) in regions.iter().zip(mips) {
                if !staging.write_bytes(region.buffer_offset, &mip.pixels) {
                    return Err(CoreError::Misuse("staging buffer is not host visible".into()));
                }
            }

            self.record(image, &regions, staging.handle)?;

            let cmds = [self.cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            self.queue
                .submit(&self.device, &[submit], self.fence)
                .map_err(|e| CoreError::vk("Failed to submit texture upload", e))?;
            self.pending = true;

            match self.wait() {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.stalled.push((staging, image.clone()));
                    Err(e)
                }
            }
        }
    }
}

impl Drop for TransferUploader {
    fn drop(&mut self) {
        unsafe {
            if self.wait().is_err() {
                let _ = self.queue.wait_idle(&self.device);
            }
            self.stalled.clear();
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
