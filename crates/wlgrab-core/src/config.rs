use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::BackendKind;
use crate::CaptureError;

/// Largest pool the capture backend will allocate.
pub const MAX_BUFFER_COUNT: usize = 8;

/// Capture session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Zero-based index into the compositor's advertised outputs.
    #[serde(alias = "outputIndex")]
    pub output_index: usize,
    /// Number of in-flight frame buffers in the shared-memory pool.
    #[serde(alias = "bufferCount")]
    pub buffer_count: usize,
    /// Capture request rate driven by the frame tick.
    #[serde(alias = "targetFPS", alias = "targetFps")]
    pub target_fps: u32,
    /// Ask the compositor to composite the cursor into captured frames.
    #[serde(alias = "overlayCursor")]
    pub overlay_cursor: bool,
    /// Force a protocol instead of probing in preference order.
    pub backend: Option<BackendKind>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_index: 0,
            buffer_count: 4,
            target_fps: 60,
            overlay_cursor: false,
            backend: None,
        }
    }
}

impl CaptureConfig {
    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            CaptureError::ConfigurationInvalid { reason: format!("{}: {e}", path.display()) }
        })?;
        config.validate()?;
        debug!(?config, "Loaded capture config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(CaptureError::ConfigurationInvalid {
                reason: format!(
                    "buffer_count must be within 1..={MAX_BUFFER_COUNT}, got {}",
                    self.buffer_count
                ),
            });
        }
        if self.target_fps == 0 {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "target_fps must be non-zero".to_owned(),
            });
        }
        Ok(())
    }

    /// Interval between frame ticks in microseconds.
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.target_fps.max(1) as u64
    }
}
