//! Core tunables, read from cvars.
//!
//! `CoreConfig::register` creates every cvar with its default; a host then
//! runs its config script and takes a typed snapshot with `from_cvars`.

use std::path::PathBuf;
use std::time::Duration;

use astra_common::cvar::{CvarContext, CVAR_LATCH};

pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// (name, default, flags) for every cvar the core reads.
const CORE_CVARS: &[(&str, &str, i32)] = &[
    ("vk_frames_in_flight", "3", CVAR_LATCH),
    ("vk_big_texture_lifetime", "3", 0),
    ("vk_release_thread_threshold", "64", 0),
    ("vk_uniform_pool_size", "4194304", CVAR_LATCH),
    ("vk_stream_pool_size", "16777216", CVAR_LATCH),
    ("vk_descriptor_pool_sets", "256", CVAR_LATCH),
    ("vk_command_slots", "128", CVAR_LATCH),
    ("vk_upload_timeout", "60", 0),
    ("vk_big_texture_queue", "32", CVAR_LATCH),
    ("vk_max_texture_size", "16384", 0),
    ("vk_texture_cache_dir", "cache/textures", CVAR_LATCH),
    ("vk_shader_dir", "shaders", CVAR_LATCH),
    ("vk_validation", "0", CVAR_LATCH),
];

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Frames the CPU may record ahead of the GPU (1..=MAX_FRAMES_IN_FLIGHT).
    pub frames_in_flight: usize,
    /// Frames a big-texture slot survives without being acquired.
    pub big_texture_lifetime: u32,
    /// Pending sub-buffer releases before the release thread starts.
    pub release_thread_threshold: usize,
    pub uniform_pool_size: u64,
    pub stream_pool_size: u64,
    pub descriptor_pool_sets: u32,
    /// Upper bound on `CommandMgr::get_command_index`.
    pub command_slots: usize,
    pub upload_timeout: Duration,
    pub big_texture_queue: usize,
    pub max_texture_size: u32,
    pub texture_cache_dir: PathBuf,
    pub shader_dir: PathBuf,
    pub validation: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut cvars = CvarContext::new();
        Self::register(&mut cvars);
        Self::from_cvars(&cvars)
    }
}

fn positive(value: f32, fallback: u64) -> u64 {
    if value >= 1.0 {
        value as u64
    } else {
        fallback
    }
}

/// A byte count read from the cvar's string, so sizes past 2^24 stay exact.
fn byte_size(cvars: &CvarContext, name: &str, fallback: u64) -> u64 {
    let text = cvars.variable_string(name).trim();
    match text.parse::<u64>() {
        Ok(size) if size > 0 => size,
        _ => {
            if !text.is_empty() {
                log::warn!("{} '{}' is not a byte count, using {}", name, text, fallback);
            }
            fallback
        }
    }
}

impl CoreConfig {
    /// Create every core cvar with its default value.
    pub fn register(cvars: &mut CvarContext) {
        for &(name, value, flags) in CORE_CVARS {
            cvars.get(name, value, flags);
        }
    }

    /// Typed snapshot of the current cvar values. Out-of-range values are
    /// clamped or replaced by the default.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let frames = cvars.variable_value("vk_frames_in_flight") as usize;
        let frames_in_flight = frames.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if frames != frames_in_flight {
            log::warn!(
                "vk_frames_in_flight {} out of range, using {}",
                frames,
                frames_in_flight
            );
        }

        let dir = |name: &str, default: &str| {
            let s = cvars.variable_string(name);
            PathBuf::from(if s.is_empty() { default } else { s })
        };

        Self {
            frames_in_flight,
            big_texture_lifetime: cvars.variable_value("vk_big_texture_lifetime").max(1.0) as u32,
            release_thread_threshold: positive(cvars.variable_value("vk_release_thread_threshold"), 64)
                as usize,
            uniform_pool_size: byte_size(cvars, "vk_uniform_pool_size", 4 << 20),
            stream_pool_size: byte_size(cvars, "vk_stream_pool_size", 16 << 20),
            descriptor_pool_sets: positive(cvars.variable_value("vk_descriptor_pool_sets"), 256) as u32,
            command_slots: positive(cvars.variable_value("vk_command_slots"), 128) as usize,
            upload_timeout: Duration::from_secs(positive(cvars.variable_value("vk_upload_timeout"), 60)),
            big_texture_queue: positive(cvars.variable_value("vk_big_texture_queue"), 32) as usize,
            max_texture_size: positive(cvars.variable_value("vk_max_texture_size"), 16384) as u32,
            texture_cache_dir: dir("vk_texture_cache_dir", "cache/textures"),
            shader_dir: dir("vk_shader_dir", "shaders"),
            validation: cvars.variable_value("vk_validation") != 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.frames_in_flight, 3);
        assert_eq!(cfg.big_texture_lifetime, 3);
        assert_eq!(cfg.release_thread_threshold, 64);
        assert_eq!(cfg.upload_timeout, Duration::from_secs(60));
        assert_eq!(cfg.big_texture_queue, 32);
        assert_eq!(cfg.texture_cache_dir, PathBuf::from("cache/textures"));
        assert!(!cfg.validation);
    }

    #[test]
    fn test_script_overrides_and_clamping() {
        let mut cvars = CvarContext::new();
        CoreConfig::register(&mut cvars);
        // Latched cvars only change after the latch is applied.
        cvars.execute("set vk_frames_in_flight 9\nset vk_big_texture_lifetime 5\nset vk_validation 1");
        cvars.get_latched_vars();

        let cfg = CoreConfig::from_cvars(&cvars);
        assert_eq!(cfg.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(cfg.big_texture_lifetime, 5);
        assert!(cfg.validation);
    }

    #[test]
    fn test_garbage_values_fall_back() {
        let mut cvars = CvarContext::new();
        CoreConfig::register(&mut cvars);
        cvars.set("vk_upload_timeout", "soon");
        cvars.force_set("vk_frames_in_flight", "0");
        let cfg = CoreConfig::from_cvars(&cvars);
        assert_eq!(cfg.upload_timeout, Duration::from_secs(60));
        assert_eq!(cfg.frames_in_flight, 1);
    }

    #[test]
    fn test_pool_sizes_are_exact_bytes() {
        let mut cvars = CvarContext::new();
        CoreConfig::register(&mut cvars);
        cvars.force_set("vk_stream_pool_size", "16777217");
        cvars.force_set("vk_uniform_pool_size", "6442450945");
        let cfg = CoreConfig::from_cvars(&cvars);
        assert_eq!(cfg.stream_pool_size, 16_777_217);
        assert_eq!(cfg.uniform_pool_size, 6_442_450_945);

        cvars.force_set("vk_stream_pool_size", "1.5e6");
        cvars.force_set("vk_uniform_pool_size", "0");
        let cfg = CoreConfig::from_cvars(&cvars);
        assert_eq!(cfg.stream_pool_size, 16 << 20);
        assert_eq!(cfg.uniform_pool_size, 4 << 20);
    }
}
