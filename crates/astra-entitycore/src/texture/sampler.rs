//! Sampler cache.
//!
//! Samplers are immutable and cheap to share, so every texture with the
//! same filtering asks the cache instead of creating its own.

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    Linear,
    /// Linear with linear interpolation between mips.
    #[default]
    Trilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerAddress {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub filter: SamplerFilter,
    pub address: SamplerAddress,
    pub anisotropy: bool,
    pub mip_levels: u32,
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self { filter: SamplerFilter::Trilinear, address: SamplerAddress::Repeat, anisotropy: true, mip_levels: 1 }
    }
}

impl SamplerKey {
    /// Create info for this key. `max_anisotropy` of 1 or less disables
    /// anisotropic filtering.
    pub fn create_info(&self, max_anisotropy: f32) -> vk::SamplerCreateInfo<'static> {
        let (mag, min, mipmap) = match self.filter {
            SamplerFilter::Nearest => (vk::Filter::NEAREST, vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
            SamplerFilter::Linear => (vk::Filter::LINEAR, vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST),
            SamplerFilter::Trilinear => (vk::Filter::LINEAR, vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
        };
        let address = match self.address {
            SamplerAddress::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddress::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddress::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddress::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        };
        let anisotropy = self.anisotropy && max_anisotropy > 1.0;

        vk::SamplerCreateInfo::default()
            .mag_filter(mag)
            .min_filter(min)
            .mipmap_mode(mipmap)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(self.mip_levels.max(1) as f32)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
    }
}

pub struct SamplerCache {
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
    max_anisotropy: f32,
    device: ash::Device,
}

impl SamplerCache {
    pub fn new(device: &ash::Device, max_anisotropy: f32) -> Self {
        Self { samplers: Mutex::new(HashMap::new()), max_anisotropy, device: device.clone() }
    }

    pub unsafe fn get(&self, key: SamplerKey) -> CoreResult<vk::Sampler> {
        let mut samplers = self.samplers.lock();
        if let Some(&sampler) = samplers.get(&key) {
            return Ok(sampler);
        }
        let sampler = self
            .device
            .create_sampler(&key.create_info(self.max_anisotropy), None)
            .map_err(|e| CoreError::vk("Failed to create sampler", e))?;
        samplers.insert(key, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        unsafe {
            for (_, sampler) in self.samplers.get_mut().drain() {
                self.device.destroy_sampler(sampler, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_hash_by_every_field() {
        let base = SamplerKey::default();
        let keys: HashSet<_> = [
            base,
            SamplerKey { filter: SamplerFilter::Nearest, ..base },
            SamplerKey { address: SamplerAddress::ClampToEdge, ..base },
            SamplerKey { anisotropy: false, ..base },
            SamplerKey { mip_levels: 12, ..base },
            base,
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_create_info_filters() {
        let info = SamplerKey { filter: SamplerFilter::Nearest, ..Default::default() }.create_info(16.0);
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::NEAREST);

        let info = SamplerKey::default().create_info(16.0);
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
    }

    #[test]
    fn test_create_info_anisotropy() {
        let info = SamplerKey::default().create_info(16.0);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 16.0);

        // Unsupported by the device.
        let info = SamplerKey::default().create_info(1.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);

        let info = SamplerKey { anisotropy: false, ..Default::default() }.create_info(16.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.max_anisotropy, 1.0);
    }

    #[test]
    fn test_create_info_lod_covers_mips() {
        let info = SamplerKey { mip_levels: 9, ..Default::default() }.create_info(1.0);
        assert_eq!(info.max_lod, 9.0);
        let info = SamplerKey { address: SamplerAddress::ClampToEdge, ..Default::default() }.create_info(1.0);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    }
}
