//! Error type shared by every fallible constructor of the core.
//!
//! Runtime failures the renderer can survive (pool exhaustion, a dropped
//! frame, a missing texture) are logged where they happen and never reach
//! this type; it only carries the ones the caller has to act on.

use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use astra_common::save_data::SaveDataError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A Vulkan entry point returned an error code.
    #[error("{context}: {result:?}")]
    Vk {
        context: &'static str,
        result: vk::Result,
    },

    /// The Vulkan loader library could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No physical device or queue family fits our needs.
    #[error("Unsupported device: {0}")]
    Unsupported(String),

    /// The device memory allocator refused a request.
    #[error("Allocation failed for {name}: {message}")]
    Allocation { name: String, message: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Cache error: {0}")]
    Cache(#[from] SaveDataError),

    /// A cache or model file had the wrong layout.
    #[error("Bad format in {path:?}: {message}")]
    Format { path: PathBuf, message: String },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: String },

    #[error("{0} not found")]
    NotFound(String),

    /// The caller broke an ordering rule (e.g. built a pipeline on an
    /// unbuilt layout).
    #[error("Misuse: {0}")]
    Misuse(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Wrap a raw Vulkan result with a short description of the call.
    pub fn vk(context: &'static str, result: vk::Result) -> Self {
        CoreError::Vk { context, result }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io { path: path.into(), source }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        CoreError::Format { path: path.into(), message: message.into() }
    }

    /// The raw Vulkan code, if this error came from a Vulkan call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            CoreError::Vk { result, .. } => Some(*result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_error_display() {
        let e = CoreError::vk("Failed to create command pool", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let s = e.to_string();
        assert!(s.starts_with("Failed to create command pool"));
        assert!(s.contains("ERROR_OUT_OF_HOST_MEMORY"));
        assert_eq!(e.vk_result(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    }

    #[test]
    fn test_non_vk_errors_have_no_code() {
        let e = CoreError::NotFound("pipeline 'stars'".into());
        assert_eq!(e.to_string(), "pipeline 'stars' not found");
        assert_eq!(e.vk_result(), None);

        let e = CoreError::from(SaveDataError::BadHeader);
        assert!(matches!(e, CoreError::Cache(_)));
    }
}
