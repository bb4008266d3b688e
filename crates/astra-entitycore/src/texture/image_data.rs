//! CPU-side pixel data: decoding, resolution limits and mip chains.

use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::vulkan::memory::full_mip_count;

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ImageData {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || pixels.len() != (width * height * 4) as usize {
            return None;
        }
        Some(Self { width, height, pixels })
    }

    /// Opaque white 1×1, used when a texture can't be loaded.
    pub fn fallback() -> Self {
        Self { width: 1, height: 1, pixels: vec![255; 4] }
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Decode an encoded image (PNG, TGA, JPEG).
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self { width, height, pixels: rgba.into_raw() })
    }

    /// Read and decode `path`, halving it until neither side exceeds
    /// `max_resolution`.
    pub fn decode_file(path: &Path, max_resolution: u32) -> CoreResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
        let mut data = Self::decode(&bytes)?;
        while data.width.max(data.height) > max_resolution.max(1) {
            data = data.downsample();
        }
        Ok(data)
    }

    /// 2×2 box filter to half size. Odd edges reuse the last row/column.
    pub fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);

        let texel = |x: u32, y: u32, c: usize| -> u32 {
            let x = x.min(self.width - 1);
            let y = y.min(self.height - 1);
            self.pixels[((y * self.width + x) * 4) as usize + c] as u32
        };

        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = (x * 2, y * 2);
                for c in 0..4 {
                    let sum = texel(sx, sy, c) + texel(sx + 1, sy, c) + texel(sx, sy + 1, c) + texel(sx + 1, sy + 1, c);
                    pixels.push(((sum + 2) / 4) as u8);
                }
            }
        }
        Self { width, height, pixels }
    }

    /// This image followed by every smaller level down to 1×1.
    pub fn mip_chain(self) -> Vec<ImageData> {
        let levels = full_mip_count(self.width, self.height) as usize;
        let mut chain = Vec::with_capacity(levels);
        chain.push(self);
        while chain.len() < levels {
            let next = chain[chain.len() - 1].downsample();
            chain.push(next);
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn checker(width: u32, height: u32) -> ImageData {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                pixels.extend_from_slice(&[v, v, v, 255]);
            }
        }
        ImageData::new(width, height, pixels).unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(ImageData::new(2, 2, vec![0; 15]).is_none());
        assert!(ImageData::new(0, 2, Vec::new()).is_none());
        assert!(ImageData::new(2, 2, vec![0; 16]).is_some());
    }

    #[test]
    fn test_downsample_averages() {
        let half = checker(4, 4).downsample();
        assert_eq!((half.width, half.height), (2, 2));
        // Every 2×2 block holds two white and two black texels.
        assert!(half.pixels.chunks(4).all(|p| p[0] == 128 && p[3] == 255));
    }

    #[test]
    fn test_downsample_odd_size() {
        let half = checker(3, 1).downsample();
        assert_eq!((half.width, half.height), (1, 1));
    }

    #[test]
    fn test_mip_chain_reaches_one_by_one() {
        let chain = checker(8, 2).mip_chain();
        let sizes: Vec<_> = chain.iter().map(|m| (m.width, m.height)).collect();
        assert_eq!(sizes, vec![(8, 2), (4, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn test_decode_png() {
        let data = ImageData::decode(&png_bytes(3, 2)).unwrap();
        assert_eq!((data.width, data.height), (3, 2));
        assert_eq!(&data.pixels[0..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        assert!(matches!(ImageData::decode(b"not an image"), Err(CoreError::Image(_))));
    }

    #[test]
    fn test_decode_file_limits_resolution() {
        let dir = std::env::temp_dir().join(format!("astra_image_data_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("big.png");
        std::fs::write(&path, png_bytes(64, 16)).unwrap();

        let data = ImageData::decode_file(&path, 16).unwrap();
        assert_eq!((data.width, data.height), (16, 4));

        let missing = ImageData::decode_file(&dir.join("missing.png"), 16);
        assert!(matches!(missing, Err(CoreError::Io { .. })));
        std::fs::remove_dir_all(&dir).ok();
    }
}
