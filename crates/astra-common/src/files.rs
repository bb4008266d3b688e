// files.rs: file helpers for the on-disk caches

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Turn a resource path into a flat cache key: path separators and drive
/// colons become underscores.
pub fn sanitize_cache_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Cache file name for a resource: the sanitized name with its extension
/// replaced by `ext` (e.g. "textures/sky.png" -> "textures_sky.dat").
pub fn cache_file_name(name: &str, ext: &str) -> String {
    let flat = sanitize_cache_name(name);
    let stem = match flat.rfind('.') {
        Some(dot) if dot > 0 => &flat[..dot],
        _ => flat.as_str(),
    };
    format!("{}.{}", stem, ext)
}

/// Full path of a cache file inside `dir`.
pub fn cache_path(dir: &Path, name: &str, ext: &str) -> PathBuf {
    dir.join(cache_file_name(name, ext))
}

/// Last modification time of a file in whole seconds since the epoch, or
/// `None` if the file does not exist or the platform has no mtime.
pub fn modification_time(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(secs as i64)
}

/// Read a whole file, logging the failure.
pub fn load_file(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Some(data),
        Err(e) => {
            log::debug!("couldn't load {}: {}", path.display(), e);
            None
        }
    }
}
