//! GraphicsResourceRegistry: the shared GPU resources of one device.
//!
//! Owns the memory manager, the uniform and stream pools, the descriptor
//! pools, the texture manager, and everything modules share by name
//! (layouts, pipelines) or by source (textures). Constructors that need
//! these take the registry by reference; nothing lives in statics, so
//! teardown order is the field order below.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;

use crate::buffer::{BufferKind, BufferMgr, BufferStats};
use crate::config::CoreConfig;
use crate::descriptor::SetMgr;
use crate::error::CoreResult;
use crate::pipeline::{ComputePipeline, Pipeline, PipelineLayout};
use crate::texture::mipmap::{mipmap_shader_code, MIPMAP_SHADER};
use crate::texture::{MipmapGenerator, Texture, TextureMgr, TextureOptions, TextureStats};
use crate::vulkan::{MemoryManager, Vulkan};

type TextureKey = (PathBuf, TextureOptions);

/// Look up `key`, or load it with `load` and remember it if `keep` allows.
/// Entries whose value was dropped are pruned on every miss.
fn share_weak<K: Eq + Hash, T>(
    cache: &mut HashMap<K, Weak<T>>,
    key: K,
    load: impl FnOnce() -> Arc<T>,
    keep: impl FnOnce(&T) -> bool,
) -> Arc<T> {
    if let Some(value) = cache.get(&key).and_then(Weak::upgrade) {
        return value;
    }
    cache.retain(|_, weak| weak.strong_count() > 0);
    let value = load();
    if keep(&value) {
        cache.insert(key, Arc::downgrade(&value));
    }
    value
}

/// Fallbacks aren't shared so a fixed file loads next time.
fn cached_texture(
    cache: &mut HashMap<TextureKey, Weak<Texture>>,
    key: TextureKey,
    load: impl FnOnce() -> Arc<Texture>,
) -> Arc<Texture> {
    share_weak(cache, key, load, |texture| !texture.is_fallback())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub uniforms: BufferStats,
    pub stream: BufferStats,
    pub textures: TextureStats,
    pub cached_textures: usize,
    pub descriptor_pools: usize,
}

pub struct GraphicsResourceRegistry {
    textures: Mutex<HashMap<TextureKey, Weak<Texture>>>,
    pipelines: Mutex<HashMap<String, Arc<Pipeline>>>,
    compute: Mutex<HashMap<String, Arc<ComputePipeline>>>,
    layouts: Mutex<HashMap<String, Arc<PipelineLayout>>>,
    mipmaps: Option<MipmapGenerator>,
    texture_mgr: TextureMgr,
    sets: Arc<SetMgr>,
    uniforms: Arc<BufferMgr>,
    stream: Arc<BufferMgr>,
    memory: Arc<MemoryManager>,
    config: CoreConfig,
}

impl GraphicsResourceRegistry {
    pub unsafe fn new(ctx: &Vulkan, config: &CoreConfig) -> CoreResult<Self> {
        let memory = Arc::new(MemoryManager::new(ctx)?);
        let frames = config.frames_in_flight;

        let uniforms = Arc::new(BufferMgr::new(
            &memory,
            "uniform pool",
            config.uniform_pool_size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferKind::HostVisible,
            ctx.uniform_alignment(),
            config.release_thread_threshold,
            frames,
        )?);
        let stream = Arc::new(BufferMgr::new(
            &memory,
            "stream pool",
            config.stream_pool_size,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferKind::HostVisible,
            ctx.uniform_alignment(),
            config.release_thread_threshold,
            frames,
        )?);
        let sets = Arc::new(SetMgr::new(ctx, config.descriptor_pool_sets, frames)?);
        let texture_mgr = TextureMgr::new(ctx, memory.clone(), config)?;

        let mipmaps = match mipmap_shader_code(&config.shader_dir) {
            Ok(Some(code)) => match MipmapGenerator::new(&ctx.device, &sets, &code) {
                Ok(generator) => Some(generator),
                Err(e) => {
                    log::warn!("Compute mip generation unavailable: {}", e);
                    None
                }
            },
            Ok(None) => {
                log::debug!("No {} shipped or built in; blended mips are built on the CPU only", MIPMAP_SHADER);
                None
            }
            Err(e) => {
                log::warn!("Compute mip generation unavailable: {}", e);
                None
            }
        };

        log::info!(
            "Graphics resources: {} frames in flight, {} KiB uniforms, {} KiB stream",
            frames,
            config.uniform_pool_size / 1024,
            config.stream_pool_size / 1024
        );

        Ok(Self {
            textures: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            compute: Mutex::new(HashMap::new()),
            layouts: Mutex::new(HashMap::new()),
            mipmaps,
            texture_mgr,
            sets,
            uniforms,
            stream,
            memory,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn uniform_pool(&self) -> &Arc<BufferMgr> {
        &self.uniforms
    }

    pub fn stream_pool(&self) -> &Arc<BufferMgr> {
        &self.stream
    }

    pub fn sets(&self) -> &Arc<SetMgr> {
        &self.sets
    }

    pub fn texture_mgr(&self) -> &TextureMgr {
        &self.texture_mgr
    }

    pub fn mipmap_generator(&self) -> Option<&MipmapGenerator> {
        self.mipmaps.as_ref()
    }

    // ============================================================
    // Textures
    // ============================================================

    /// The texture for `path` with `options`, shared with every other user
    /// asking for the same pair while any of them still holds it.
    pub fn texture(&self, path: &Path, options: &TextureOptions) -> Arc<Texture> {
        let mut textures = self.textures.lock();
        cached_texture(&mut textures, (path.to_path_buf(), *options), || {
            self.texture_mgr.load_texture(path, options)
        })
    }

    /// Load several textures, decoding the uncached ones in parallel.
    pub fn preload_textures(&self, paths: &[PathBuf], options: &TextureOptions) -> Vec<Arc<Texture>> {
        let mut textures = self.textures.lock();
        let missing: Vec<PathBuf> = paths
            .iter()
            .filter(|path| {
                let key = ((*path).clone(), *options);
                textures.get(&key).and_then(Weak::upgrade).is_none()
            })
            .cloned()
            .collect();

        let mut loaded: HashMap<PathBuf, Arc<Texture>> =
            missing.iter().cloned().zip(self.texture_mgr.load_batch(&missing, options)).collect();

        paths
            .iter()
            .map(|path| {
                cached_texture(&mut textures, (path.clone(), *options), || {
                    loaded.remove(path).unwrap_or_else(|| self.texture_mgr.fallback())
                })
            })
            .collect()
    }

    // ============================================================
    // Shared pipelines
    // ============================================================

    /// Share `layout` under `name`. A name already taken keeps its first
    /// layout, which is returned.
    pub fn register_layout(&self, name: &str, layout: PipelineLayout) -> Arc<PipelineLayout> {
        self.layouts.lock().entry(name.to_string()).or_insert_with(|| Arc::new(layout)).clone()
    }

    pub fn layout(&self, name: &str) -> Option<Arc<PipelineLayout>> {
        self.layouts.lock().get(name).cloned()
    }

    pub fn register_pipeline(&self, name: &str, pipeline: Pipeline) -> Arc<Pipeline> {
        self.pipelines.lock().entry(name.to_string()).or_insert_with(|| Arc::new(pipeline)).clone()
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.lock().get(name).cloned()
    }

    pub fn register_compute(&self, name: &str, pipeline: ComputePipeline) -> Arc<ComputePipeline> {
        self.compute.lock().entry(name.to_string()).or_insert_with(|| Arc::new(pipeline)).clone()
    }

    pub fn compute_pipeline(&self, name: &str) -> Option<Arc<ComputePipeline>> {
        self.compute.lock().get(name).cloned()
    }

    // ============================================================
    // Frame
    // ============================================================

    /// `frame`'s fence has been waited: recycle what it retired.
    pub unsafe fn begin_frame(&self, frame: usize) {
        self.uniforms.begin_frame(frame);
        self.stream.begin_frame(frame);
        self.sets.begin_frame(frame);
        self.texture_mgr.begin_frame(frame);
    }

    pub fn end_frame(&self) {
        self.texture_mgr.end_frame();
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            uniforms: self.uniforms.stats(),
            stream: self.stream.stats(),
            textures: self.texture_mgr.stats(),
            cached_textures: self.textures.lock().values().filter(|t| t.strong_count() > 0).count(),
            descriptor_pools: self.sets.pool_count(),
        }
    }

    /// Drop shared objects and flush every deferred release. The device must
    /// be idle. Handles still held elsewhere stay valid until dropped.
    pub unsafe fn shutdown(&self) {
        self.textures.lock().clear();
        self.pipelines.lock().clear();
        self.compute.lock().clear();
        self.layouts.lock().clear();
        self.texture_mgr.shutdown();
        self.sets.retire_all();
        self.uniforms.allocator().retire_all();
        self.stream.allocator().retire_all();
        log::info!("Graphics resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Texture handles need a device; the sharing rules are the same for any
    // value.

    #[test]
    fn test_live_entries_are_shared() {
        let mut cache = HashMap::new();
        let a = share_weak(&mut cache, "sun.png", || Arc::new(1), |_| true);
        let b = share_weak(&mut cache, "sun.png", || Arc::new(2), |_| true);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);
    }

    #[test]
    fn test_dropped_entries_reload_and_prune() {
        let mut cache = HashMap::new();
        drop(share_weak(&mut cache, "moon.png", || Arc::new(1), |_| true));
        let again = share_weak(&mut cache, "moon.png", || Arc::new(2), |_| true);
        assert_eq!(*again, 2);

        drop(again);
        let _earth = share_weak(&mut cache, "earth.png", || Arc::new(3), |_| true);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejected_values_are_not_shared() {
        let mut cache = HashMap::new();
        let fallback = share_weak(&mut cache, "missing.png", || Arc::new(0), |&v| v != 0);
        assert!(cache.is_empty());
        let loaded = share_weak(&mut cache, "missing.png", || Arc::new(5), |&v| v != 0);
        assert!(!Arc::ptr_eq(&fallback, &loaded));
        assert_eq!(cache.len(), 1);
    }
}
