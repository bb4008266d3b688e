// save_data.rs: tagged, length-prefixed key/value serialization
//
// Used by the on-disk caches. Every value is a one-byte tag followed by its
// payload; variable-size payloads carry a little-endian u32 length prefix.
// A save file is the magic, a format version, then one root value.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

const SAVE_MAGIC: [u8; 4] = *b"ASAV";
const SAVE_VERSION: u32 = 1;

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

/// Nesting limit when decoding, so corrupt input cannot recurse forever.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SaveDataError {
    #[error("unexpected end of data at byte {0}")]
    Truncated(usize),
    #[error("unknown tag {tag} at byte {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("invalid utf-8 string at byte {0}")]
    InvalidString(usize),
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("bad magic or unsupported version")]
    BadHeader,
    #[error("{len} trailing bytes after root value")]
    TrailingBytes { len: usize },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One serialized value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SaveData {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<SaveData>),
    Map(BTreeMap<String, SaveData>),
}

impl SaveData {
    pub fn new_map() -> Self {
        SaveData::Map(BTreeMap::new())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SaveData::Bool(b) => Some(*b),
            SaveData::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SaveData::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SaveData::Float(f) => Some(*f),
            SaveData::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SaveData::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key. Non-map values have no keys.
    pub fn get(&self, key: &str) -> Option<&SaveData> {
        match self {
            SaveData::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Insert into a map, turning a non-map value into an empty map first.
    pub fn insert(&mut self, key: impl Into<String>, value: SaveData) -> Option<SaveData> {
        if !matches!(self, SaveData::Map(_)) {
            *self = SaveData::new_map();
        }
        match self {
            SaveData::Map(m) => m.insert(key.into(), value),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<SaveData> {
        match self {
            SaveData::Map(m) => m.remove(key),
            _ => None,
        }
    }

    // ========================================================
    // Encoding
    // ========================================================

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            SaveData::Nil => out.push(TAG_NIL),
            SaveData::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            SaveData::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            SaveData::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            SaveData::Str(s) => {
                out.push(TAG_STR);
                put_len_prefixed(out, s.as_bytes());
            }
            SaveData::Bytes(b) => {
                out.push(TAG_BYTES);
                put_len_prefixed(out, b);
            }
            SaveData::List(items) => {
                out.push(TAG_LIST);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            SaveData::Map(map) => {
                out.push(TAG_MAP);
                out.extend_from_slice(&(map.len() as u32).to_le_bytes());
                for (key, item) in map {
                    put_len_prefixed(out, key.as_bytes());
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    // ========================================================
    // Decoding
    // ========================================================

    /// Decode exactly one value occupying all of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<SaveData, SaveDataError> {
        let mut reader = Reader { data, pos: 0 };
        let value = reader.value(0)?;
        if reader.pos != data.len() {
            return Err(SaveDataError::TrailingBytes { len: data.len() - reader.pos });
        }
        Ok(value)
    }
}

fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SaveDataError> {
        let end = self.pos.checked_add(n).ok_or(SaveDataError::Truncated(self.pos))?;
        if end > self.data.len() {
            return Err(SaveDataError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SaveDataError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SaveDataError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, SaveDataError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<&'a [u8], SaveDataError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, SaveDataError> {
        let start = self.pos;
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| SaveDataError::InvalidString(start))
    }

    fn value(&mut self, depth: usize) -> Result<SaveData, SaveDataError> {
        if depth > MAX_DEPTH {
            return Err(SaveDataError::TooDeep);
        }
        let offset = self.pos;
        let tag = self.u8()?;
        Ok(match tag {
            TAG_NIL => SaveData::Nil,
            TAG_BOOL => SaveData::Bool(self.u8()? != 0),
            TAG_INT => SaveData::Int(self.u64()? as i64),
            TAG_FLOAT => SaveData::Float(f64::from_bits(self.u64()?)),
            TAG_STR => SaveData::Str(self.string()?),
            TAG_BYTES => SaveData::Bytes(self.bytes()?.to_vec()),
            TAG_LIST => {
                let count = self.u32()? as usize;
                // Every item is at least one byte; reject impossible counts early.
                if count > self.data.len() - self.pos {
                    return Err(SaveDataError::Truncated(self.pos));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                SaveData::List(items)
            }
            TAG_MAP => {
                let count = self.u32()? as usize;
                if count > self.data.len() - self.pos {
                    return Err(SaveDataError::Truncated(self.pos));
                }
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = self.string()?;
                    let item = self.value(depth + 1)?;
                    map.insert(key, item);
                }
                SaveData::Map(map)
            }
            tag => return Err(SaveDataError::UnknownTag { tag, offset }),
        })
    }
}

// ============================================================
// BigSave: a SaveData tree persisted to one file
// ============================================================

/// A save file holding one root map.
#[derive(Debug, Default)]
pub struct BigSave {
    pub root: SaveData,
}

impl BigSave {
    pub fn new() -> Self {
        Self { root: SaveData::new_map() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&SAVE_MAGIC);
        out.extend_from_slice(&SAVE_VERSION.to_le_bytes());
        self.root.encode(&mut out);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SaveDataError> {
        if data.len() < 8 || data[0..4] != SAVE_MAGIC {
            return Err(SaveDataError::BadHeader);
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != SAVE_VERSION {
            return Err(SaveDataError::BadHeader);
        }
        Ok(Self { root: SaveData::from_bytes(&data[8..])? })
    }

    /// Load from disk.
    pub fn load(path: &Path) -> Result<Self, SaveDataError> {
        let data = fs::read(path).map_err(|source| SaveDataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&data)
    }

    /// Load from disk, starting empty if the file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(save) => save,
            Err(SaveDataError::Io { .. }) => Self::new(),
            Err(e) => {
                log::warn!("{}: discarding unreadable save ({})", path.display(), e);
                Self::new()
            }
        }
    }

    /// Write to disk through a temporary file so a crash never leaves a
    /// half-written save behind.
    pub fn save(&self, path: &Path) -> Result<(), SaveDataError> {
        let io_err = |source| SaveDataError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&self.to_bytes()).map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveData {
        let mut entry = SaveData::new_map();
        entry.insert("width", SaveData::Int(8192));
        entry.insert("height", SaveData::Int(4096));
        entry.insert("mtime", SaveData::Int(1_700_000_000));
        entry.insert("cached", SaveData::Bool(true));
        entry.insert("gamma", SaveData::Float(2.2));
        entry.insert("tags", SaveData::List(vec![SaveData::Str("sky".into()), SaveData::Nil]));
        entry.insert("blob", SaveData::Bytes(vec![0, 1, 2, 255]));

        let mut root = SaveData::new_map();
        root.insert("textures_milkyway_png", entry);
        root
    }

    #[test]
    fn test_nested_tree_survives_encoding() {
        let root = sample();
        let decoded = SaveData::from_bytes(&root.to_bytes()).unwrap();
        assert_eq!(decoded, root);

        let entry = decoded.get("textures_milkyway_png").unwrap();
        assert_eq!(entry.get("width").and_then(SaveData::as_int), Some(8192));
        assert_eq!(entry.get("cached").and_then(SaveData::as_bool), Some(true));
        assert_eq!(entry.get("gamma").and_then(SaveData::as_float), Some(2.2));
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let bytes = sample().to_bytes();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(SaveData::from_bytes(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unknown_tag_and_trailing_bytes() {
        match SaveData::from_bytes(&[42]) {
            Err(SaveDataError::UnknownTag { tag: 42, offset: 0 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        match SaveData::from_bytes(&[TAG_NIL, TAG_NIL]) {
            Err(SaveDataError::TrailingBytes { len: 1 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_huge_list_count_does_not_allocate() {
        let mut bytes = vec![TAG_LIST];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(SaveData::from_bytes(&bytes), Err(SaveDataError::Truncated(_))));
    }

    #[test]
    fn test_insert_converts_scalar_to_map() {
        let mut v = SaveData::Int(3);
        v.insert("k", SaveData::Bool(false));
        assert_eq!(v.get("k"), Some(&SaveData::Bool(false)));
        assert_eq!(v.remove("k"), Some(SaveData::Bool(false)));
        assert!(v.get("k").is_none());
    }

    #[test]
    fn test_big_save_file() {
        let dir = std::env::temp_dir().join(format!("astra-save-{}", std::process::id()));
        let path = dir.join("texture-cache");
        let save = BigSave { root: sample() };
        save.save(&path).unwrap();

        let loaded = BigSave::load(&path).unwrap();
        assert_eq!(loaded.root, save.root);

        std::fs::write(&path, b"garbage!").unwrap();
        assert!(matches!(BigSave::load(&path), Err(SaveDataError::BadHeader)));
        assert_eq!(BigSave::load_or_default(&path).root, SaveData::new_map());
        assert_eq!(BigSave::load_or_default(&dir.join("missing")).root, SaveData::new_map());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
