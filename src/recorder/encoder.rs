//! Encoder sink contract and format negotiation
//!
//! The session and the trim re-encoder both drive an `EncoderSink`: hand it a
//! video track and an optional audio track, receive encoded chunks in order
//! on a channel, pause/resume it, and stop it to flush the tail.

use super::error::{RecordingError, RecordingResult};
use crate::capture::media::{AudioTrack, VideoTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Container/codec combination produced by an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingFormat {
    #[serde(rename = "webm;codecs=vp9,opus")]
    WebmVp9Opus,
    #[serde(rename = "webm;codecs=vp8,opus")]
    WebmVp8Opus,
    /// Guaranteed baseline
    #[serde(rename = "webm")]
    Webm,
}

impl RecordingFormat {
    /// Default preference list, most capable first
    pub fn preferences() -> Vec<RecordingFormat> {
        vec![
            RecordingFormat::WebmVp9Opus,
            RecordingFormat::WebmVp8Opus,
            RecordingFormat::Webm,
        ]
    }

    pub fn mime_subtype(&self) -> &'static str {
        match self {
            RecordingFormat::WebmVp9Opus => "webm;codecs=vp9,opus",
            RecordingFormat::WebmVp8Opus => "webm;codecs=vp8,opus",
            RecordingFormat::Webm => "webm",
        }
    }

    pub fn mime_type(&self) -> String {
        format!("video/{}", self.mime_subtype())
    }

    pub fn extension(&self) -> &'static str {
        "webm"
    }

    /// ffmpeg video encoder name
    pub fn video_encoder(&self) -> &'static str {
        match self {
            RecordingFormat::WebmVp9Opus => "libvpx-vp9",
            RecordingFormat::WebmVp8Opus | RecordingFormat::Webm => "libvpx",
        }
    }

    /// ffmpeg audio encoder name
    pub fn audio_encoder(&self) -> &'static str {
        match self {
            RecordingFormat::WebmVp9Opus | RecordingFormat::WebmVp8Opus => "libopus",
            RecordingFormat::Webm => "libvorbis",
        }
    }
}

impl std::fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime_subtype())
    }
}

impl FromStr for RecordingFormat {
    type Err = RecordingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .trim_start_matches("video/")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "webm;codecs=vp9,opus" | "vp9" => Ok(RecordingFormat::WebmVp9Opus),
            "webm;codecs=vp8,opus" | "vp8" => Ok(RecordingFormat::WebmVp8Opus),
            "webm" => Ok(RecordingFormat::Webm),
            _ => Err(RecordingError::Configuration(format!(
                "Unknown recording format: {}",
                s
            ))),
        }
    }
}

/// Answers whether the local encoder can produce a format
pub trait FormatProbe: Send + Sync {
    fn is_supported(&self, format: RecordingFormat) -> bool;
}

/// Pick the first supported format from `preferences`.
///
/// The last entry is the guaranteed baseline and is returned when nothing
/// probes as supported. Only an empty list is an error.
pub fn select_format(
    preferences: &[RecordingFormat],
    probe: &dyn FormatProbe,
) -> RecordingResult<RecordingFormat> {
    for format in preferences {
        if probe.is_supported(*format) {
            tracing::info!("Selected recording format {}", format);
            return Ok(*format);
        }
        tracing::debug!("Recording format {} not supported", format);
    }

    let baseline = preferences
        .last()
        .copied()
        .ok_or(RecordingError::FormatUnavailable)?;
    tracing::warn!(
        "No preferred format probed as supported, using baseline {}",
        baseline
    );
    Ok(baseline)
}

/// Parameters for one encoding run
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub format: RecordingFormat,
    pub frame_rate: u32,
    /// Chunk emission period, independent of frame rate
    pub chunk_interval: Duration,
}

/// Output of a running encoder, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Chunk(Vec<u8>),
    Fatal(String),
}

#[async_trait]
pub trait EncoderSink: Send {
    /// Begin encoding. Chunks arrive on the returned channel, which closes
    /// once the encoder has fully stopped.
    async fn start(
        &mut self,
        video: VideoTrack,
        audio: Option<AudioTrack>,
        request: &EncodeRequest,
    ) -> RecordingResult<mpsc::UnboundedReceiver<EncoderEvent>>;

    fn pause(&mut self);

    fn resume(&mut self);

    fn is_paused(&self) -> bool;

    /// Flush pending output and stop. Idempotent.
    async fn stop(&mut self) -> RecordingResult<()>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self, format: RecordingFormat) -> RecordingResult<Box<dyn EncoderSink>>;
}
