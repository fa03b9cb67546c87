use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wlgrab_core::CaptureConfig;

/// Environment variable naming a config file when no argument is given.
pub const CONFIG_ENV: &str = "WLGRAB_CONFIG";

/// Recorder configuration: the capture session plus recorder-side limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    #[serde(flatten)]
    pub capture:       CaptureConfig,
    /// Stop after this many delivered frames.
    #[serde(alias = "maxFrames")]
    pub max_frames:    Option<u64>,
    /// Frames buffered between the capture thread and the recorder task
    /// before new ones are dropped.
    #[serde(alias = "channelDepth")]
    pub channel_depth: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { capture: CaptureConfig::default(), max_frames: None, channel_depth: 8 }
    }
}

impl RecorderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        debug!(?config, "Loaded recorder config");
        Ok(config)
    }

    /// Config file from the first CLI argument, else `$WLGRAB_CONFIG`, else
    /// defaults.
    pub fn from_args_or_env(arg: Option<String>) -> Result<Self> {
        match arg.or_else(|| std::env::var(CONFIG_ENV).ok()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        ensure!(self.channel_depth > 0, "channel_depth must be non-zero");
        ensure!(self.max_frames != Some(0), "max_frames must be non-zero when set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlgrab_core::BackendKind;

    #[test]
    fn capture_fields_are_flattened() {
        let json = r#"{
            "bufferCount": 2,
            "targetFPS": 30,
            "backend": "ext-image-copy-capture",
            "maxFrames": 120,
            "channelDepth": 4
        }"#;

        let cfg: RecorderConfig = serde_json::from_str(json).expect("valid recorder config");
        assert_eq!(cfg.capture.buffer_count, 2);
        assert_eq!(cfg.capture.target_fps, 30);
        assert_eq!(cfg.capture.backend, Some(BackendKind::ExtImageCopyCapture));
        assert_eq!(cfg.max_frames, Some(120));
        assert_eq!(cfg.channel_depth, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_object_is_default() {
        let cfg: RecorderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RecorderConfig::default());
    }

    #[test]
    fn validation_covers_both_layers() {
        let mut cfg = RecorderConfig { channel_depth: 0, ..Default::default() };
        assert!(cfg.validate().is_err());

        cfg.channel_depth = 8;
        cfg.capture.buffer_count = 9;
        assert!(cfg.validate().is_err());

        cfg.capture.buffer_count = 4;
        cfg.max_frames = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let path = std::env::temp_dir().join(format!("wlgrab-recorder-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"outputIndex": 1, "max_frames": 10}"#).unwrap();
        let cfg = RecorderConfig::from_args_or_env(Some(path.display().to_string())).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.capture.output_index, 1);
        assert_eq!(cfg.max_frames, Some(10));
    }
}
