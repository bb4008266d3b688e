//! On-disk texture cache.
//!
//! `texture-cache` is a `BigSave` map from sanitized source path to the
//! source's size, modification time and whether a raw mip chain was
//! written. The raw chains live next to it as `<sanitized name>.dat`:
//!
//! ```text
//! "AMIP" | u32 levels | levels × (u32 width | u32 height | RGBA8 pixels)
//! ```
//!
//! A missing or corrupt cache is an empty cache.

use std::fs;
use std::path::{Path, PathBuf};

use astra_common::files::{cache_path, modification_time, sanitize_cache_name};
use astra_common::save_data::{BigSave, SaveData};

use super::image_data::ImageData;
use crate::error::{CoreError, CoreResult};

pub const CACHE_FILE: &str = "texture-cache";

const MIP_MAGIC: [u8; 4] = *b"AMIP";

/// Metadata kept for one source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub width: u32,
    pub height: u32,
    pub mtime: i64,
    pub raw_mips: bool,
}

impl CacheEntry {
    fn to_save(self) -> SaveData {
        let mut map = SaveData::new_map();
        map.insert("width", SaveData::Int(self.width as i64));
        map.insert("height", SaveData::Int(self.height as i64));
        map.insert("mtime", SaveData::Int(self.mtime));
        map.insert("raw", SaveData::Bool(self.raw_mips));
        map
    }

    fn from_save(data: &SaveData) -> Option<Self> {
        Some(Self {
            width: data.get("width")?.as_int()? as u32,
            height: data.get("height")?.as_int()? as u32,
            mtime: data.get("mtime")?.as_int()?,
            raw_mips: data.get("raw").and_then(SaveData::as_bool).unwrap_or(false),
        })
    }
}

pub struct TextureCache {
    dir: PathBuf,
    save: BigSave,
    dirty: bool,
}

impl TextureCache {
    pub fn open(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), save: BigSave::load_or_default(&dir.join(CACHE_FILE)), dirty: false }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Entry for `name`, if one was recorded for a source with this `mtime`.
    pub fn lookup(&self, name: &str, mtime: i64) -> Option<CacheEntry> {
        let entry = CacheEntry::from_save(self.save.root.get(&sanitize_cache_name(name))?)?;
        (entry.mtime == mtime).then_some(entry)
    }

    pub fn record(&mut self, name: &str, entry: CacheEntry) {
        let key = sanitize_cache_name(name);
        let current = self.save.root.get(&key).and_then(CacheEntry::from_save);
        if current != Some(entry) {
            self.save.root.insert(key, entry.to_save());
            self.dirty = true;
        }
    }

    /// Write `texture-cache` if anything changed since the last save.
    pub fn save(&mut self) -> CoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.save.save(&self.dir.join(CACHE_FILE))?;
        self.dirty = false;
        Ok(())
    }

    pub fn raw_path(&self, name: &str) -> PathBuf {
        cache_path(&self.dir, name, "dat")
    }

    /// The cached mip chain for `name` if the cache is current for `source`.
    pub fn quick_load(&self, name: &str, source: &Path) -> Option<Vec<ImageData>> {
        let mtime = modification_time(source)?;
        let entry = self.lookup(name, mtime)?;
        if !entry.raw_mips {
            return None;
        }
        match read_raw_mips(&self.raw_path(name)) {
            Ok(mips) if mips[0].width == entry.width && mips[0].height == entry.height => Some(mips),
            Ok(_) => {
                log::debug!("{}: cached mips don't match the recorded size", name);
                None
            }
            Err(e) => {
                log::debug!("{}: ignoring raw mip cache ({})", name, e);
                None
            }
        }
    }

    /// Write the mip chain for `name` and record it.
    pub fn store(&mut self, name: &str, source: &Path, mips: &[ImageData]) -> CoreResult<()> {
        let Some(mtime) = modification_time(source) else {
            return Ok(());
        };
        let Some(base) = mips.first() else {
            return Ok(());
        };
        write_raw_mips(&self.raw_path(name), mips)?;
        self.record(name, CacheEntry { width: base.width, height: base.height, mtime, raw_mips: true });
        Ok(())
    }
}

pub fn write_raw_mips(path: &Path, mips: &[ImageData]) -> CoreResult<()> {
    let total: usize = mips.iter().map(|m| 8 + m.byte_len()).sum();
    let mut out = Vec::with_capacity(8 + total);
    out.extend_from_slice(&MIP_MAGIC);
    out.extend_from_slice(&(mips.len() as u32).to_le_bytes());
    for mip in mips {
        out.extend_from_slice(&mip.width.to_le_bytes());
        out.extend_from_slice(&mip.height.to_le_bytes());
        out.extend_from_slice(&mip.pixels);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    fs::write(path, out).map_err(|e| CoreError::io(path, e))
}

pub fn read_raw_mips(path: &Path) -> CoreResult<Vec<ImageData>> {
    let data = fs::read(path).map_err(|e| CoreError::io(path, e))?;
    parse_raw_mips(&data).map_err(|message| CoreError::format(path, message))
}

fn parse_raw_mips(data: &[u8]) -> Result<Vec<ImageData>, String> {
    let read_u32 = |at: usize| -> Result<u32, String> {
        data.get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| format!("truncated at byte {}", at))
    };

    if data.len() < 8 || data[0..4] != MIP_MAGIC {
        return Err("bad magic".into());
    }
    let levels = read_u32(4)?;
    if levels == 0 || levels > 32 {
        return Err(format!("{} mip levels", levels));
    }

    let mut mips: Vec<ImageData> = Vec::with_capacity(levels as usize);
    let mut at = 8;
    for level in 0..levels {
        let width = read_u32(at)?;
        let height = read_u32(at + 4)?;
        at += 8;

        if let Some(prev) = mips.last() {
            if width != (prev.width / 2).max(1) || height != (prev.height / 2).max(1) {
                return Err(format!("level {} is {}x{} after {}x{}", level, width, height, prev.width, prev.height));
            }
        }
        let len = (width as usize) * (height as usize) * 4;
        let pixels = data.get(at..at + len).ok_or_else(|| format!("level {} truncated", level))?;
        at += len;
        let mip = ImageData::new(width, height, pixels.to_vec()).ok_or_else(|| format!("level {} is empty", level))?;
        mips.push(mip);
    }
    if at != data.len() {
        return Err(format!("{} trailing bytes", data.len() - at));
    }
    Ok(mips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("astra_texcache_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn chain() -> Vec<ImageData> {
        ImageData::new(4, 2, (0..32).collect()).unwrap().mip_chain()
    }

    // ============================================================
    // Raw mip blobs
    // ============================================================

    #[test]
    fn test_raw_mips_written_and_read_back() {
        let dir = temp_dir("raw");
        let path = dir.join("sky.dat");
        write_raw_mips(&path, &chain()).unwrap();
        assert_eq!(read_raw_mips(&path).unwrap(), chain());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_raw_mips_are_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MIP_MAGIC);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 16]);
        // Second level claims 2x2 after a 2x2 base.
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 16]);
        assert!(parse_raw_mips(&bytes).unwrap_err().contains("level 1"));

        assert!(parse_raw_mips(b"NOPE\0\0\0\0").is_err());
        assert!(parse_raw_mips(&bytes[..20]).is_err());
    }

    // ============================================================
    // Metadata
    // ============================================================

    #[test]
    fn test_lookup_requires_matching_mtime() {
        let dir = temp_dir("lookup");
        let mut cache = TextureCache::open(&dir);
        let entry = CacheEntry { width: 8192, height: 4096, mtime: 100, raw_mips: false };
        cache.record("textures/milkyway.png", entry);
        assert!(cache.is_dirty());

        assert_eq!(cache.lookup("textures/milkyway.png", 100), Some(entry));
        assert_eq!(cache.lookup("textures/milkyway.png", 101), None);
        assert_eq!(cache.lookup("textures/other.png", 100), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_only_when_changed() {
        let dir = temp_dir("save");
        let mut cache = TextureCache::open(&dir);
        let entry = CacheEntry { width: 2, height: 2, mtime: 7, raw_mips: true };
        cache.record("a.png", entry);
        cache.save().unwrap();
        assert!(!cache.is_dirty());

        cache.record("a.png", entry);
        assert!(!cache.is_dirty());

        let reopened = TextureCache::open(&dir);
        assert_eq!(reopened.lookup("a.png", 7), Some(entry));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_cache_file_is_empty() {
        let dir = temp_dir("corrupt");
        fs::write(dir.join(CACHE_FILE), b"garbage").unwrap();
        let cache = TextureCache::open(&dir);
        assert_eq!(cache.lookup("a.png", 0), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_store_then_quick_load() {
        let dir = temp_dir("quick");
        let source = dir.join("moon.png");
        fs::write(&source, b"source bytes").unwrap();

        let mut cache = TextureCache::open(&dir);
        assert!(cache.quick_load("moon.png", &source).is_none());
        cache.store("moon.png", &source, &chain()).unwrap();
        assert_eq!(cache.quick_load("moon.png", &source), Some(chain()));
        assert!(cache.raw_path("moon.png").ends_with("moon.dat"));

        // A missing source can't be validated.
        assert!(cache.quick_load("moon.png", &dir.join("gone.png")).is_none());
        fs::remove_dir_all(&dir).ok();
    }
}
