//! TextureMgr: synchronous texture loads plus the big-texture streamer.
//!
//! Frame protocol, on the render thread:
//!
//! 1. `begin_frame(frame)` once that frame's fence was waited; images
//!    evicted or dropped the last time this frame index came round are
//!    destroyed.
//! 2. `acquire_big` for every big texture drawn this frame.
//! 3. `process_ready` with a single-use command slot open, to take
//!    ownership of finished uploads.
//! 4. `end_frame`.
//!
//! A failed big-texture load is held back for a while, then requested again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use rayon::prelude::*;

use super::big_texture::{BigTexturePool, BigTextureStats, FailedLoads};
use super::cache::TextureCache;
use super::image_data::ImageData;
use super::loader::{acquire_barrier, LoadRequest, LoadResult, LoaderWorker, SharedPool, TextureUploader, TransferUploader};
use super::mipmap::blend_mip_chain;
use super::sampler::{SamplerCache, SamplerKey};
use super::texture::{Texture, TextureOptions};
use crate::command::CommandMgr;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::vulkan::{GpuImage, MemoryManager, QueueHandle, QueueTarget, RetireRing, Vulkan};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureStats {
    pub big: BigTextureStats,
    /// Big textures requested but not uploaded yet.
    pub pending: usize,
    /// Failed loads waiting out their backoff.
    pub held_back: usize,
    /// Evicted or dropped images waiting for their frame to come round.
    pub dropping: usize,
    pub samplers: usize,
}

pub struct TextureMgr {
    memory: Arc<MemoryManager>,
    device: ash::Device,
    samplers: SamplerCache,
    uploader: Mutex<TransferUploader>,
    cache: Arc<Mutex<TextureCache>>,
    fallback: Arc<Texture>,

    big: SharedPool<GpuImage>,
    loader: Mutex<Option<LoaderWorker>>,
    pending: Mutex<HashSet<String>>,
    failed: Mutex<FailedLoads>,
    /// Images of dropped textures and evicted slots.
    retired: Arc<RetireRing<Arc<GpuImage>>>,

    transfer: QueueHandle,
    graphics_family: u32,
    max_texture_size: u32,
    queue_capacity: usize,
    upload_timeout: std::time::Duration,
}

impl TextureMgr {
    pub unsafe fn new(ctx: &Vulkan, memory: Arc<MemoryManager>, config: &CoreConfig) -> CoreResult<Self> {
        let graphics = ctx.queue(QueueTarget::Graphics);
        // Synchronous loads stay on the graphics family: no ownership transfer.
        let mut uploader =
            TransferUploader::new(&ctx.device, memory.clone(), graphics.clone(), graphics.family, config.upload_timeout)?;
        let samplers = SamplerCache::new(&ctx.device, ctx.max_anisotropy());
        let retired = Arc::new(RetireRing::new(config.frames_in_flight));
        let fallback = upload_texture(
            &memory,
            &mut uploader,
            &samplers,
            &retired,
            "fallback",
            &[ImageData::fallback()],
            &TextureOptions::default(),
            true,
        )?;

        Ok(Self {
            memory,
            device: ctx.device.clone(),
            samplers,
            uploader: Mutex::new(uploader),
            cache: Arc::new(Mutex::new(TextureCache::open(&config.texture_cache_dir))),
            fallback: Arc::new(fallback),
            big: Arc::new(Mutex::new(BigTexturePool::new(config.big_texture_lifetime))),
            loader: Mutex::new(None),
            pending: Mutex::new(HashSet::new()),
            failed: Mutex::new(FailedLoads::new()),
            retired,
            transfer: ctx.queue(QueueTarget::Transfer).clone(),
            graphics_family: graphics.family,
            max_texture_size: config.max_texture_size,
            queue_capacity: config.big_texture_queue,
            upload_timeout: config.upload_timeout,
        })
    }

    /// The shared 1×1 placeholder.
    pub fn fallback(&self) -> Arc<Texture> {
        self.fallback.clone()
    }

    fn resolution_limit(&self, options: &TextureOptions) -> u32 {
        options.max_resolution.unwrap_or(self.max_texture_size).min(self.max_texture_size)
    }

    fn upload(&self, name: &str, mips: &[ImageData], options: &TextureOptions) -> CoreResult<Texture> {
        let mut uploader = self.uploader.lock();
        upload_texture(&self.memory, &mut uploader, &self.samplers, &self.retired, name, mips, options, false)
    }

    fn finish_load(&self, path: &Path, decoded: CoreResult<ImageData>, options: &TextureOptions) -> Arc<Texture> {
        let name = path.to_string_lossy();
        let loaded = decoded.and_then(|base| {
            let mips = match (options.mipmap, options.blend_mips) {
                (false, _) => vec![base],
                (true, false) => base.mip_chain(),
                (true, true) => blend_mip_chain(base),
            };
            self.upload(&name, &mips, options)
        });
        match loaded {
            Ok(texture) => Arc::new(texture),
            Err(e) => {
                log::warn!("{}: {}; using placeholder", name, e);
                self.fallback()
            }
        }
    }

    /// Load and upload one texture. A missing or broken file gives the
    /// placeholder.
    pub fn load_texture(&self, path: &Path, options: &TextureOptions) -> Arc<Texture> {
        let decoded = ImageData::decode_file(path, self.resolution_limit(options));
        self.finish_load(path, decoded, options)
    }

    /// Decode many textures in parallel, then upload them in order.
    pub fn load_batch(&self, paths: &[PathBuf], options: &TextureOptions) -> Vec<Arc<Texture>> {
        let limit = self.resolution_limit(options);
        let decoded: Vec<CoreResult<ImageData>> =
            paths.par_iter().map(|path| ImageData::decode_file(path, limit)).collect();
        paths
            .iter()
            .zip(decoded)
            .map(|(path, decoded)| self.finish_load(path, decoded, options))
            .collect()
    }

    // ============================================================
    // Big textures
    // ============================================================

    fn with_loader<R>(&self, f: impl FnOnce(&LoaderWorker) -> R) -> Option<R> {
        let mut loader = self.loader.lock();
        if loader.is_none() {
            let uploader = unsafe {
                TransferUploader::new(
                    &self.device,
                    self.memory.clone(),
                    self.transfer.clone(),
                    self.graphics_family,
                    self.upload_timeout,
                )
            };
            let worker = uploader.and_then(|uploader| {
                LoaderWorker::spawn(uploader, self.big.clone(), self.cache.clone(), self.queue_capacity)
            });
            match worker {
                Ok(worker) => *loader = Some(worker),
                Err(e) => {
                    log::error!("Couldn't start the big texture loader: {}", e);
                    return None;
                }
            }
        }
        loader.as_ref().map(f)
    }

    /// Use the big texture at `path` this frame. `None` until it has been
    /// streamed in; the first call queues the load.
    pub fn acquire_big(&self, path: &Path, mipmap: bool) -> Option<vk::DescriptorImageInfo> {
        let name = path.to_string_lossy().into_owned();
        let mut big = self.big.lock();
        if let Some(index) = big.touch(&name) {
            let slot = big.slot(index)?;
            if !slot.ready {
                return None;
            }
            let key = SamplerKey { mip_levels: slot.levels, ..SamplerKey::default() };
            let sampler = match unsafe { self.samplers.get(key) } {
                Ok(sampler) => sampler,
                Err(e) => {
                    log::error!("{}: {}", name, e);
                    return None;
                }
            };
            return Some(vk::DescriptorImageInfo {
                sampler,
                image_view: slot.image.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            });
        }
        drop(big);

        let mut pending = self.pending.lock();
        if pending.contains(&name) || self.failed.lock().is_held(&name) {
            return None;
        }
        let request = LoadRequest {
            name: name.clone(),
            path: path.to_path_buf(),
            max_resolution: self.max_texture_size,
            mipmap,
        };
        if self.with_loader(|loader| loader.request(request)).unwrap_or(false) {
            pending.insert(name);
        }
        None
    }

    /// Take ownership of finished uploads on the graphics queue and mark
    /// them ready. Barriers go into the slot currently recording on
    /// `commands`. Returns how many textures became ready.
    pub fn process_ready(&self, commands: &mut CommandMgr) -> usize {
        let results: Vec<LoadResult> = {
            let loader = self.loader.lock();
            match loader.as_ref() {
                Some(loader) => std::iter::from_fn(|| loader.pop_ready()).collect(),
                None => return 0,
            }
        };
        if results.is_empty() {
            return 0;
        }

        let mut pending = self.pending.lock();
        let mut big = self.big.lock();
        let mut barriers = Vec::new();
        let mut finished = Vec::new();
        for result in results {
            pending.remove(result.name());
            match result {
                LoadResult::Ready { name } => {
                    self.failed.lock().succeeded(&name);
                    if let Some(slot) = big.find(&name).and_then(|index| big.slot(index)) {
                        if let Some(barrier) =
                            acquire_barrier(slot.image.handle, slot.levels, self.transfer.family, self.graphics_family)
                        {
                            barriers.push(barrier);
                        }
                        finished.push(name);
                    }
                }
                LoadResult::Failed { name } => {
                    // Free the slot; the old pixels were already overwritten.
                    if let Some(index) = big.find(&name) {
                        if let Some(slot) = big.slot_mut(index) {
                            slot.occupant.clear();
                            slot.ready = false;
                        }
                    }
                    log::debug!("{}: held back before the next try", name);
                    self.failed.lock().record(&name);
                }
            }
        }

        if !barriers.is_empty() {
            let recorded = commands.record_outside_render_pass(|device, cmd| unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                );
            });
            if !recorded {
                log::error!("{} big textures lost: no command slot to record their ownership barriers", finished.len());
                for name in &finished {
                    if let Some(index) = big.find(name) {
                        if let Some(slot) = big.slot_mut(index) {
                            slot.occupant.clear();
                        }
                    }
                }
                return 0;
            }
        }

        for name in &finished {
            if let Some(index) = big.find(name) {
                if let Some(slot) = big.slot_mut(index) {
                    slot.ready = true;
                }
            }
        }
        finished.len()
    }

    pub fn end_frame(&self) {
        self.big.lock().end_frame();
        self.failed.lock().end_frame();
    }

    /// Evict every big-texture slot nobody acquired for a full lifetime, and
    /// allow failed loads to be tried again. The images are destroyed once
    /// this frame index comes round again.
    pub fn release_unused_memory(&self) -> usize {
        self.failed.lock().clear();
        let released = self.big.lock().release_unused();
        let count = released.len();
        if count > 0 {
            self.retired.extend(released);
            log::debug!("Evicted {} big texture slots", count);
        }
        count
    }

    /// `frame`'s fence has been waited.
    pub fn begin_frame(&self, frame: usize) {
        drop(self.retired.begin_frame(frame));
    }

    pub fn stats(&self) -> TextureStats {
        TextureStats {
            big: self.big.lock().stats(),
            pending: self.pending.lock().len(),
            held_back: self.failed.lock().held(),
            dropping: self.retired.len(),
            samplers: self.samplers.len(),
        }
    }

    pub fn save_cache(&self) {
        if let Err(e) = self.cache.lock().save() {
            log::warn!("Couldn't save texture cache: {}", e);
        }
    }

    /// Stop the loader and free every big texture. The device must be idle.
    pub fn shutdown(&self) {
        if let Some(mut loader) = self.loader.lock().take() {
            loader.shutdown();
        }
        self.save_cache();
        self.pending.lock().clear();
        self.failed.lock().clear();
        drop(self.retired.take_all());
        let mut big = self.big.lock();
        *big = BigTexturePool::new(big.lifetime());
    }
}

impl Drop for TextureMgr {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn upload_texture(
    memory: &MemoryManager,
    uploader: &mut TransferUploader,
    samplers: &SamplerCache,
    retired: &Arc<RetireRing<Arc<GpuImage>>>,
    name: &str,
    mips: &[ImageData],
    options: &TextureOptions,
    fallback: bool,
) -> CoreResult<Texture> {
    let base = &mips[0];
    let levels = mips.len() as u32;
    unsafe {
        let image = Arc::new(memory.create_texture_2d(
            base.width,
            base.height,
            options.format,
            levels,
            options.image_usage(),
            name,
        )?);
        // On a timeout the uploader keeps `image` until its copy finishes.
        uploader.upload(&image, mips)?;
        let sampler = samplers.get(options.sampler_key(levels))?;
        Ok(Texture::new(name, image, sampler, fallback, retired))
    }
}
