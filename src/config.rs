//! Recorder settings
//!
//! Loaded from a JSON file; every field has a default so a partial (or
//! missing) file still yields a usable configuration.

use crate::capture::traits::{OverlayPosition, ViewportSize};
use crate::recorder::state::RecordingConfig;
use crate::utils::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("open-screencast")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_seek_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSettings {
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Where direct-to-disk recordings are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Camera bubble center in UI space
    #[serde(default)]
    pub overlay: OverlayPosition,

    /// Size of the UI the overlay position refers to
    #[serde(default)]
    pub viewport: Option<ViewportSize>,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: PathBuf,

    #[serde(default = "default_seek_timeout_ms")]
    pub seek_timeout_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            output_dir: default_output_dir(),
            overlay: OverlayPosition::default(),
            viewport: None,
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            seek_timeout_ms: default_seek_timeout_ms(),
        }
    }
}

impl RecorderSettings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No settings at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let settings: Self = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }
}
