//! Texture handles.
//!
//! A `Texture` is an uploaded, sampled image. Dropping the last `Arc` to it
//! parks the GPU image in the texture manager's retirement ring; it is
//! destroyed once every frame that could have sampled it has finished. A
//! `StreamTexture` only names a texture and loads it on first use.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::sampler::{SamplerAddress, SamplerFilter, SamplerKey};
use super::texture_mgr::TextureMgr;
use crate::vulkan::{Deferred, GpuImage, RetireRing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureOptions {
    pub mipmap: bool,
    /// Largest side after loading; bigger sources are halved until they fit.
    pub max_resolution: Option<u32>,
    /// Alpha-weighted mips, and storage usage so the compute mip pass can
    /// rebuild them on the GPU.
    pub blend_mips: bool,
    pub filter: SamplerFilter,
    pub address: SamplerAddress,
    pub format: vk::Format,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            mipmap: true,
            max_resolution: None,
            blend_mips: false,
            filter: SamplerFilter::Trilinear,
            address: SamplerAddress::Repeat,
            format: vk::Format::R8G8B8A8_UNORM,
        }
    }
}

impl TextureOptions {
    pub fn sampler_key(&self, mip_levels: u32) -> SamplerKey {
        SamplerKey { filter: self.filter, address: self.address, anisotropy: self.mipmap, mip_levels }
    }

    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        if self.blend_mips {
            vk::ImageUsageFlags::STORAGE
        } else {
            vk::ImageUsageFlags::empty()
        }
    }
}

pub struct Texture {
    name: String,
    image: Deferred<Arc<GpuImage>>,
    sampler: vk::Sampler,
    fallback: bool,
}

impl Texture {
    pub(crate) fn new(
        name: &str,
        image: Arc<GpuImage>,
        sampler: vk::Sampler,
        fallback: bool,
        retire: &Arc<RetireRing<Arc<GpuImage>>>,
    ) -> Self {
        Self { name: name.to_string(), image: Deferred::new(image, retire), sampler, fallback }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the source couldn't be loaded and this is the 1×1
    /// placeholder.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.image.extent.width, self.image.extent.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// A texture loaded on first use.
pub struct StreamTexture {
    path: PathBuf,
    options: TextureOptions,
    resident: Mutex<Option<Arc<Texture>>>,
}

impl StreamTexture {
    pub fn new(path: impl Into<PathBuf>, options: TextureOptions) -> Arc<Self> {
        Arc::new(Self { path: path.into(), options, resident: Mutex::new(None) })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn is_resident(&self) -> bool {
        self.resident.lock().is_some()
    }

    /// Load the texture unless it already is. Never fails: a missing file
    /// yields the fallback texture.
    pub fn ensure_resident(&self, mgr: &TextureMgr) -> Arc<Texture> {
        let mut resident = self.resident.lock();
        if let Some(texture) = resident.as_ref() {
            return texture.clone();
        }
        let texture = mgr.load_texture(&self.path, &self.options);
        *resident = Some(texture.clone());
        texture
    }

    /// Drop this handle's reference. The GPU image goes away a frame cycle
    /// after no `Set` holds the texture any more.
    pub fn evict(&self) -> bool {
        self.resident.lock().take().is_some()
    }
}
