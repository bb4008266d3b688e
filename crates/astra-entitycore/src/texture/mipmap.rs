//! Alpha-weighted mip chains.
//!
//! Textures drawn with depth-sorted blending (halos, nebulae, trails) darken
//! at a distance when their mips are box filtered, because transparent
//! texels drag the color towards whatever RGB they happen to store. Here the
//! color of each mip texel is weighted by alpha instead.
//!
//! `blend_mip_chain` does this on the CPU at load time. `MipmapGenerator`
//! does the same on the GPU with `mipmap_blend.comp`, for textures whose
//! base level is written on the device. Its SPIR-V comes from
//! `vk_shader_dir`, or from the copy build.rs compiles in when glslc is
//! installed; with neither, blended mips are CPU only.

use std::path::Path;
use std::sync::Arc;

use ash::vk;

use super::image_data::ImageData;
use super::texture::Texture;
use crate::command::{CommandMgr, CommandRecorder};
use crate::descriptor::{Set, SetMgr};
use crate::error::{CoreError, CoreResult};
use crate::pipeline::{ComputePipeline, PipelineLayout};
use crate::vulkan::memory::full_mip_count;

pub const MIPMAP_SHADER: &str = "mipmap_blend.comp.spv";

#[cfg(embedded_mipmap_shader)]
const BUILT_IN_SHADER: Option<&[u8]> = Some(include_bytes!(concat!(env!("OUT_DIR"), "/spirv/mipmap_blend.comp.spv")));
#[cfg(not(embedded_mipmap_shader))]
const BUILT_IN_SHADER: Option<&[u8]> = None;

/// SPIR-V of the blend shader. A file in `shader_dir` wins over the built-in
/// copy; `Ok(None)` when there is neither.
pub fn mipmap_shader_code(shader_dir: &Path) -> CoreResult<Option<Vec<u32>>> {
    let path = shader_dir.join(MIPMAP_SHADER);
    if path.exists() {
        let mut file = std::fs::File::open(&path).map_err(|e| CoreError::io(&path, e))?;
        return ash::util::read_spv(&mut file).map(Some).map_err(|e| CoreError::io(&path, e));
    }
    match BUILT_IN_SHADER {
        Some(bytes) => ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map(Some)
            .map_err(|e| CoreError::io(MIPMAP_SHADER, e)),
        None => Ok(None),
    }
}
/// Workgroup side, passed to the shader as specialization constants 0 and 1.
pub const MIPMAP_LOCAL_SIZE: u32 = 8;

/// One level down with alpha-weighted color. Odd edges reuse the last
/// row/column.
pub fn blend_downsample(src: &ImageData) -> ImageData {
    let width = (src.width / 2).max(1);
    let height = (src.height / 2).max(1);
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);

    let texel = |x: u32, y: u32| -> [u32; 4] {
        let x = x.min(src.width - 1);
        let y = y.min(src.height - 1);
        let i = ((y * src.width + x) * 4) as usize;
        let p = &src.pixels[i..i + 4];
        [p[0] as u32, p[1] as u32, p[2] as u32, p[3] as u32]
    };

    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = (x * 2, y * 2);
            let quad = [texel(sx, sy), texel(sx + 1, sy), texel(sx, sy + 1), texel(sx + 1, sy + 1)];
            let alpha: u32 = quad.iter().map(|t| t[3]).sum();
            for c in 0..3 {
                let value = if alpha == 0 {
                    // Fully transparent: nothing to weight by.
                    (quad.iter().map(|t| t[c]).sum::<u32>() + 2) / 4
                } else {
                    (quad.iter().map(|t| t[c] * t[3]).sum::<u32>() + alpha / 2) / alpha
                };
                pixels.push(value as u8);
            }
            pixels.push(((alpha + 2) / 4) as u8);
        }
    }
    ImageData { width, height, pixels }
}

/// `base` followed by every alpha-weighted level down to 1×1.
pub fn blend_mip_chain(base: ImageData) -> Vec<ImageData> {
    let levels = full_mip_count(base.width, base.height) as usize;
    let mut chain = Vec::with_capacity(levels);
    chain.push(base);
    while chain.len() < levels {
        let next = blend_downsample(&chain[chain.len() - 1]);
        chain.push(next);
    }
    chain
}

/// Workgroup counts for writing levels `1..levels` of a `width`×`height`
/// image.
pub fn mip_dispatch_sizes(width: u32, height: u32, levels: u32, local_size: u32) -> Vec<(u32, u32)> {
    let local = local_size.max(1);
    (1..levels)
        .map(|level| {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            (w.div_ceil(local), h.div_ceil(local))
        })
        .collect()
}

/// Layout transition (or plain execution barrier when the layouts match)
/// over `count` levels starting at `base`.
pub fn level_barrier(
    image: vk::Image,
    base: u32,
    count: u32,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(from)
        .new_layout(to)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base,
            level_count: count,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Per-level views and sets for one texture. Must outlive every command
/// buffer recorded against it.
pub struct MipChainTarget {
    sets: Vec<Set>,
    views: Vec<vk::ImageView>,
    texture: Arc<Texture>,
    device: ash::Device,
}

impl MipChainTarget {
    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn levels(&self) -> u32 {
        self.views.len() as u32
    }
}

impl Drop for MipChainTarget {
    fn drop(&mut self) {
        self.sets.clear();
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
        }
    }
}

pub struct MipmapGenerator {
    pipeline: ComputePipeline,
    layout: PipelineLayout,
    sets: Arc<SetMgr>,
    device: ash::Device,
}

impl MipmapGenerator {
    /// `code` is the blend shader, see `mipmap_shader_code`.
    pub unsafe fn new(device: &ash::Device, sets: &Arc<SetMgr>, code: &[u32]) -> CoreResult<Self> {
        let mut layout = PipelineLayout::new(device, "mipmap_blend");
        layout
            .set_storage_image_location(0, 0, vk::ShaderStageFlags::COMPUTE)
            .set_storage_image_location(0, 1, vk::ShaderStageFlags::COMPUTE);
        layout.build()?;

        let pipeline =
            ComputePipeline::from_code(device, &layout, code, &[(0, MIPMAP_LOCAL_SIZE), (1, MIPMAP_LOCAL_SIZE)])?;

        Ok(Self { pipeline, layout, sets: sets.clone(), device: device.clone() })
    }

    /// Views and sets for `texture`, which needs more than one mip level and
    /// `blend_mips` (storage usage).
    pub unsafe fn target(&self, texture: Arc<Texture>) -> CoreResult<MipChainTarget> {
        let levels = texture.mip_levels();
        if levels < 2 {
            return Err(CoreError::Misuse(format!("{} has no mips to generate", texture.name())));
        }
        let (handle, format) = (texture.image().handle, texture.image().format);

        let mut target = MipChainTarget { sets: Vec::new(), views: Vec::new(), texture, device: self.device.clone() };
        for level in 0..levels {
            let info = vk::ImageViewCreateInfo::default()
                .image(handle)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = self
                .device
                .create_image_view(&info, None)
                .map_err(|e| CoreError::vk("Failed to create mip level view", e))?;
            target.views.push(view);
        }

        for level in 1..levels as usize {
            let mut set = Set::new(&self.device, &self.sets, &self.layout, 0)?;
            set.bind_storage_image(0, target.views[level - 1]).bind_storage_image(1, target.views[level]);
            target.sets.push(set);
        }
        Ok(target)
    }

    /// Record the whole chain into the selected slot, outside a render pass.
    /// The texture is expected in SHADER_READ_ONLY_OPTIMAL and is left there.
    pub fn record(&self, commands: &mut CommandMgr, target: &mut MipChainTarget) -> bool {
        let image = target.texture.image();
        let (handle, levels) = (image.handle, image.mip_levels);
        let sizes = mip_dispatch_sizes(image.extent.width, image.extent.height, levels, MIPMAP_LOCAL_SIZE);

        let to_general = level_barrier(
            handle,
            0,
            levels,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
        let recorded = commands.record_outside_render_pass(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_general],
            );
        });
        if !recorded || !commands.bind_pipeline(&self.pipeline) {
            return false;
        }

        for (level, (set, (x, y))) in target.sets.iter_mut().zip(sizes).enumerate() {
            if !commands.bind_set(&self.pipeline, set, 0) || !commands.dispatch(x, y, 1) {
                log::error!("Mip generation for {} stopped at level {}", target.texture.name(), level + 1);
                return false;
            }
            let written = level_barrier(
                handle,
                level as u32 + 1,
                1,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::SHADER_READ,
            );
            commands.record_outside_render_pass(|device, cmd| unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[written],
                );
            });
        }

        let to_read = level_barrier(
            handle,
            0,
            levels,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        commands.record_outside_render_pass(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_read],
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image(width: u32, height: u32, texels: &[[u8; 4]]) -> ImageData {
        ImageData::new(width, height, texels.iter().flatten().copied().collect()).unwrap()
    }

    // ============================================================
    // CPU chain
    // ============================================================

    #[test]
    fn test_transparent_texels_do_not_tint() {
        let src = image(2, 2, &[[255, 0, 0, 255], [255, 255, 255, 0], [255, 255, 255, 0], [255, 255, 255, 0]]);
        let mip = blend_downsample(&src);
        assert_eq!(mip.pixels, vec![255, 0, 0, 64]);

        // The box filter lets the invisible white bleed in.
        assert_eq!(src.downsample().pixels[1], 191);
    }

    #[test]
    fn test_fully_transparent_quad_averages() {
        let src = image(2, 2, &[[0, 0, 0, 0], [100, 100, 100, 0], [0, 0, 0, 0], [100, 100, 100, 0]]);
        assert_eq!(blend_downsample(&src).pixels, vec![50, 50, 50, 0]);
    }

    #[test]
    fn test_opaque_matches_box_filter() {
        let src = image(2, 2, &[[10, 20, 30, 255], [30, 40, 50, 255], [50, 60, 70, 255], [70, 80, 90, 255]]);
        assert_eq!(blend_downsample(&src), src.downsample());
    }

    #[test]
    fn test_blend_chain_sizes() {
        let base = ImageData::new(4, 2, vec![200; 4 * 2 * 4]).unwrap();
        let chain = blend_mip_chain(base);
        let sizes: Vec<_> = chain.iter().map(|m| (m.width, m.height)).collect();
        assert_eq!(sizes, vec![(4, 2), (2, 1), (1, 1)]);
        assert!(chain.iter().all(|m| m.pixels.iter().all(|&p| p == 200)));
    }

    // ============================================================
    // GPU recording helpers
    // ============================================================

    #[test]
    fn test_dispatch_sizes_cover_each_level() {
        let sizes = mip_dispatch_sizes(100, 40, full_mip_count(100, 40), 8);
        assert_eq!(sizes.len(), 6);
        assert_eq!(sizes[0], (7, 3)); // 50×20
        assert_eq!(sizes[1], (4, 2)); // 25×10
        assert_eq!(sizes[5], (1, 1)); // 1×1
        assert!(mip_dispatch_sizes(16, 16, 1, 8).is_empty());
    }

    #[test]
    fn test_level_barrier_range() {
        let image = vk::Image::from_raw(7);
        let barrier = level_barrier(
            image,
            3,
            1,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.subresource_range.base_mip_level, 3);
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }

    // ============================================================
    // Shader lookup
    // ============================================================

    fn shader_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("astra_mip_shader_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_shader_dir_file_wins() {
        let dir = shader_dir("file");
        let words: [u32; 5] = [0x0723_0203, 0x0001_0200, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(dir.join(MIPMAP_SHADER), bytes).unwrap();

        let code = mipmap_shader_code(&dir).unwrap().unwrap();
        assert_eq!(code, words);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_truncated_shader_is_an_error() {
        let dir = shader_dir("truncated");
        std::fs::write(dir.join(MIPMAP_SHADER), [3, 2, 0x23]).unwrap();
        assert!(mipmap_shader_code(&dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_shader_falls_back_to_built_in() {
        let dir = shader_dir("missing");
        let code = mipmap_shader_code(&dir).unwrap();
        assert_eq!(code.is_some(), BUILT_IN_SHADER.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
