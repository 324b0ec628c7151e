//! Recording state management
//!
//! Defines the session state machine, the pause-aware elapsed clock and the
//! finalized artifact.

use super::encoder::RecordingFormat;
use crate::compositor::{DEFAULT_BUBBLE_SIZE, TARGET_FRAME_RATE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use uuid::Uuid;

/// Current state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No recording in progress
    #[default]
    Idle,
    /// Acquiring sources and negotiating output
    Arming,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Flushing chunks and assembling the artifact
    Finalizing,
    /// Done; sources released
    Terminated,
}

impl SessionState {
    /// Recording or paused
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Recording | SessionState::Paused)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Arming => "arming",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Finalizing => "finalizing",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// One uninterrupted stretch of recording
///
/// A new segment is started each time recording is resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// Duration of this segment in milliseconds
    pub duration_ms: f64,

    /// Offset from clock start when the segment began
    pub start_offset_ms: f64,

    /// Offset from clock start when the segment ended
    pub end_offset_ms: f64,

    /// Unix timestamp when the segment began
    pub unix_start_ms: u64,

    /// Unix timestamp when the segment ended
    pub unix_end_ms: u64,
}

impl RecordingSegment {
    fn new(index: usize, offset_ms: f64) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        Self {
            index,
            duration_ms: 0.0,
            start_offset_ms: offset_ms,
            end_offset_ms: offset_ms,
            unix_start_ms: now,
            unix_end_ms: now,
        }
    }

    fn end(&mut self, offset_ms: f64) {
        self.end_offset_ms = offset_ms;
        self.duration_ms = self.end_offset_ms - self.start_offset_ms;
        self.unix_end_ms = Utc::now().timestamp_millis() as u64;
    }
}

/// Elapsed recording time, excluding pauses
#[derive(Debug, Default)]
pub struct ElapsedClock {
    origin: Option<Instant>,
    segments: Vec<RecordingSegment>,
    running: bool,
}

impl ElapsedClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset_ms(&self) -> f64 {
        self.origin
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Start from zero, discarding earlier segments
    pub fn start(&mut self) {
        self.origin = Some(Instant::now());
        self.segments.clear();
        self.segments.push(RecordingSegment::new(0, 0.0));
        self.running = true;
    }

    pub fn pause(&mut self) {
        if !self.running {
            return;
        }
        let now = self.offset_ms();
        if let Some(segment) = self.segments.last_mut() {
            segment.end(now);
        }
        self.running = false;
    }

    pub fn resume(&mut self) {
        if self.running || self.origin.is_none() {
            return;
        }
        let index = self.segments.len();
        let now = self.offset_ms();
        self.segments.push(RecordingSegment::new(index, now));
        self.running = true;
    }

    /// Freeze the clock. Same as pause, kept for readability at call sites.
    pub fn stop(&mut self) {
        self.pause();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Total recorded time so far
    pub fn elapsed(&self) -> Duration {
        let completed: f64 = self
            .segments
            .iter()
            .take(self.segments.len().saturating_sub(1))
            .map(|s| s.duration_ms)
            .sum();

        let current = match self.segments.last() {
            Some(s) if self.running => self.offset_ms() - s.start_offset_ms,
            Some(s) => s.duration_ms,
            None => 0.0,
        };

        Duration::from_secs_f64((completed + current).max(0.0) / 1000.0)
    }

    pub fn segments(&self) -> &[RecordingSegment] {
        &self.segments
    }
}

fn default_true() -> bool {
    true
}

fn default_suggested_name() -> String {
    "recording".to_string()
}

fn default_capture_width() -> u32 {
    1920
}

fn default_capture_height() -> u32 {
    1080
}

fn default_chunk_interval_ms() -> u64 {
    1000
}

fn default_frame_rate() -> u32 {
    TARGET_FRAME_RATE
}

fn default_bubble_size() -> f64 {
    DEFAULT_BUBBLE_SIZE
}

fn default_format_preferences() -> Vec<RecordingFormat> {
    RecordingFormat::preferences()
}

/// Configuration for starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    /// Composite the camera bubble onto the screen
    #[serde(default = "default_true")]
    pub show_camera: bool,

    /// Mix the microphone into the recording
    #[serde(default = "default_true")]
    pub enable_mic: bool,

    /// Capture the display's system audio
    #[serde(default = "default_true")]
    pub enable_system_audio: bool,

    /// Try to stream chunks straight to a file
    #[serde(default = "default_true")]
    pub direct_to_disk: bool,

    /// File name offered to the save destination (without extension)
    #[serde(default = "default_suggested_name")]
    pub suggested_name: String,

    #[serde(default)]
    pub microphone_device_id: Option<String>,

    #[serde(default)]
    pub camera_device_id: Option<String>,

    #[serde(default)]
    pub display_id: Option<String>,

    #[serde(default = "default_capture_width")]
    pub capture_width: u32,

    #[serde(default = "default_capture_height")]
    pub capture_height: u32,

    /// Ordered most capable first; the last entry is the baseline
    #[serde(default = "default_format_preferences")]
    pub format_preferences: Vec<RecordingFormat>,

    #[serde(default = "default_chunk_interval_ms")]
    pub chunk_interval_ms: u64,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// On-screen bubble diameter in UI pixels
    #[serde(default = "default_bubble_size")]
    pub bubble_size: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            show_camera: true,
            enable_mic: true,
            enable_system_audio: true,
            direct_to_disk: true,
            suggested_name: default_suggested_name(),
            microphone_device_id: None,
            camera_device_id: None,
            display_id: None,
            capture_width: default_capture_width(),
            capture_height: default_capture_height(),
            format_preferences: default_format_preferences(),
            chunk_interval_ms: default_chunk_interval_ms(),
            frame_rate: default_frame_rate(),
            bubble_size: default_bubble_size(),
        }
    }
}

impl RecordingConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms.max(1))
    }
}

/// One contiguous piece of an artifact's byte stream
#[derive(Debug, Clone)]
pub enum ArtifactPart {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl ArtifactPart {
    async fn len(&self) -> std::io::Result<u64> {
        match self {
            ArtifactPart::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            ArtifactPart::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }
}

/// A finalized recording. Immutable; trimming produces a new one.
#[derive(Debug, Clone)]
pub struct RecordedArtifact {
    id: Uuid,
    parts: Vec<ArtifactPart>,
    duration: Duration,
    created_at: DateTime<Utc>,
    format: RecordingFormat,
}

/// Serializable summary of an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub id: Uuid,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub mime_subtype: String,
    pub location: Option<PathBuf>,
    pub size_bytes: u64,
    pub parts: usize,
}

impl RecordedArtifact {
    pub fn new(parts: Vec<ArtifactPart>, duration: Duration, format: RecordingFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            parts,
            duration,
            created_at: Utc::now(),
            format,
        }
    }

    /// Wrap an existing file, e.g. one produced by an earlier run
    pub fn from_file(path: impl Into<PathBuf>, duration: Duration, format: RecordingFormat) -> Self {
        Self::new(vec![ArtifactPart::File(path.into())], duration, format)
    }

    pub fn from_bytes(bytes: Vec<u8>, duration: Duration, format: RecordingFormat) -> Self {
        Self::new(vec![ArtifactPart::Memory(Arc::new(bytes))], duration, format)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parts(&self) -> &[ArtifactPart] {
        &self.parts
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn format(&self) -> RecordingFormat {
        self.format
    }

    pub fn mime_subtype(&self) -> &'static str {
        self.format.mime_subtype()
    }

    /// The backing file when the whole artifact lives in one file
    pub fn single_file(&self) -> Option<&Path> {
        match self.parts.as_slice() {
            [ArtifactPart::File(path)] => Some(path),
            _ => None,
        }
    }

    /// First on-disk location, if any part is on disk
    pub fn location(&self) -> Option<&Path> {
        self.parts.iter().find_map(|p| match p {
            ArtifactPart::File(path) => Some(path.as_path()),
            ArtifactPart::Memory(_) => None,
        })
    }

    pub async fn size_bytes(&self) -> std::io::Result<u64> {
        let mut total = 0;
        for part in &self.parts {
            total += part.len().await?;
        }
        Ok(total)
    }

    /// The full contiguous byte stream
    pub async fn read_all(&self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        for part in &self.parts {
            match part {
                ArtifactPart::File(path) => out.extend(tokio::fs::read(path).await?),
                ArtifactPart::Memory(bytes) => out.extend_from_slice(bytes),
            }
        }
        Ok(out)
    }

    /// Write the byte stream to `path`, returning the number of bytes written
    pub async fn save_to(&self, path: &Path) -> std::io::Result<u64> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        for part in &self.parts {
            match part {
                ArtifactPart::File(src) => {
                    let mut src = tokio::fs::File::open(src).await?;
                    written += tokio::io::copy(&mut src, &mut file).await?;
                }
                ArtifactPart::Memory(bytes) => {
                    file.write_all(bytes).await?;
                    written += bytes.len() as u64;
                }
            }
        }
        file.flush().await?;
        Ok(written)
    }

    pub async fn info(&self) -> ArtifactInfo {
        let size_bytes = match self.size_bytes().await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!("Could not size artifact {}: {}", self.id, e);
                0
            }
        };

        ArtifactInfo {
            id: self.id,
            duration_ms: self.duration_ms(),
            created_at: self.created_at,
            mime_subtype: self.mime_subtype().to_string(),
            location: self.location().map(Path::to_path_buf),
            size_bytes,
            parts: self.parts.len(),
        }
    }
}
