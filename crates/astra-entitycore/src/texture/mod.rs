//! Textures: decoding, caches, the big-texture streamer and mip generation.

pub mod big_texture;
pub mod cache;
pub mod image_data;
pub mod loader;
pub mod mipmap;
pub mod sampler;
#[allow(clippy::module_inception)]
pub mod texture;
pub mod texture_mgr;

pub use big_texture::{Acquire, BigTexRecap, BigTexturePool, BigTextureStats, FailedLoads};
pub use cache::{CacheEntry, TextureCache};
pub use image_data::ImageData;
pub use loader::{LoadRequest, LoadResult, LoaderWorker, TextureUploader, TransferUploader};
pub use mipmap::{MipChainTarget, MipmapGenerator};
pub use sampler::{SamplerAddress, SamplerCache, SamplerFilter, SamplerKey};
pub use texture::{StreamTexture, Texture, TextureOptions};
pub use texture_mgr::{TextureMgr, TextureStats};
