//! Export types
//!
//! Errors, media metadata and trim selection rules.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Shortest segment a selection may produce
pub const MIN_TRIM_LENGTH: Duration = Duration::from_millis(500);

/// Errors that can occur while trimming or probing media
#[derive(Error, Debug)]
pub enum TrimError {
    #[error("Invalid trim range {start:?}..{end:?} for a {duration:?} recording")]
    InvalidRange {
        start: Duration,
        end: Duration,
        duration: Duration,
    },

    #[error("A trim of this recording is already running")]
    AlreadyInFlight,

    #[error("Seek to {0:?} did not complete")]
    SeekFailed(Duration),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Encoding error: {0}")]
    Encoder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),
}

impl From<TrimError> for String {
    fn from(e: TrimError) -> String {
        e.to_string()
    }
}

/// Stream metadata reported by ffprobe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// None when the container carries no duration (e.g. streamed WebM)
    pub duration: Option<Duration>,
    pub has_audio: bool,
}

/// A user selection on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimSelection {
    pub start: Duration,
    pub end: Duration,
}

impl TrimSelection {
    pub fn length(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Clamp a selection into `[0, duration]` keeping at least `MIN_TRIM_LENGTH`.
///
/// The end is pushed out first; when that would pass the end of the
/// recording the start is pulled back instead. Recordings shorter than the
/// minimum select their full length.
pub fn clamp_selection(start: Duration, end: Duration, duration: Duration) -> TrimSelection {
    if duration <= MIN_TRIM_LENGTH {
        return TrimSelection {
            start: Duration::ZERO,
            end: duration,
        };
    }

    let (start, end) = if end < start { (end, start) } else { (start, end) };
    let mut start = start.min(duration);
    let mut end = end.min(duration);

    if end - start < MIN_TRIM_LENGTH {
        end = (start + MIN_TRIM_LENGTH).min(duration);
        if end - start < MIN_TRIM_LENGTH {
            start = end - MIN_TRIM_LENGTH;
        }
    }

    TrimSelection { start, end }
}
