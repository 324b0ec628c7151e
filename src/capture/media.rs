//! Media primitives
//!
//! Tracks are cheap, cloneable handles. A `VideoTrack` always exposes the most
//! recent frame and is polled by whoever renders it; an `AudioTrack` is a
//! single-consumer stream of PCM chunks. A `MediaSource` groups the tracks
//! acquired from one capability provider and owns the handle that releases
//! the underlying device.

use super::traits::Resolution;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// One RGBA video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Tightly packed RGBA pixels (4 bytes per pixel, no row padding)
    pub data: Vec<u8>,

    /// Capture timestamp in milliseconds (source-relative)
    pub timestamp_ms: f64,
}

impl VideoFrame {
    /// Create a fully transparent frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::expected_len(width, height)],
            timestamp_ms: 0.0,
        }
    }

    /// Create a frame filled with one color
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(Self::expected_len(width, height));
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data,
            timestamp_ms: 0.0,
        }
    }

    /// Wrap raw RGBA data, rejecting buffers of the wrong size
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != Self::expected_len(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
            timestamp_ms: 0.0,
        })
    }

    /// Byte length of a packed RGBA frame
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == Self::expected_len(self.width, self.height)
    }

    /// Read one pixel
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.data.get(idx..idx + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// A block of interleaved f32 PCM samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Track-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("Track '{0}' is already consumed by another sink")]
    AlreadyConsumed(String),
}

/// Read side of a video track
#[derive(Clone)]
pub struct VideoTrack {
    label: Arc<str>,
    frames: watch::Receiver<Option<Arc<VideoFrame>>>,
    ended: watch::Receiver<bool>,
}

/// Write side of a video track
pub struct VideoTrackWriter {
    frames: watch::Sender<Option<Arc<VideoFrame>>>,
    ended: watch::Sender<bool>,
}

/// Create a connected video track pair
pub fn video_track(label: impl Into<String>) -> (VideoTrackWriter, VideoTrack) {
    let (frames_tx, frames_rx) = watch::channel(None);
    let (ended_tx, ended_rx) = watch::channel(false);
    let label: String = label.into();
    (
        VideoTrackWriter {
            frames: frames_tx,
            ended: ended_tx,
        },
        VideoTrack {
            label: Arc::from(label),
            frames: frames_rx,
            ended: ended_rx,
        },
    )
}

impl VideoTrack {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The most recent frame, if the source has produced one yet
    pub fn current_frame(&self) -> Option<Arc<VideoFrame>> {
        self.frames.borrow().clone()
    }

    /// Native resolution, known once the first frame arrived
    pub fn resolution(&self) -> Option<Resolution> {
        self.frames.borrow().as_ref().map(|f| f.resolution())
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolve once the track has ended (or its writer is gone)
    pub async fn ended(&self) {
        let mut rx = self.ended.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl VideoTrackWriter {
    /// Replace the current frame
    pub fn publish(&self, frame: VideoFrame) {
        self.frames.send_replace(Some(Arc::new(frame)));
    }

    /// Replace the current frame with an already shared one
    pub fn publish_shared(&self, frame: Arc<VideoFrame>) {
        self.frames.send_replace(Some(frame));
    }

    /// Drop the retained frame
    pub fn clear(&self) {
        self.frames.send_replace(None);
    }

    /// Mark the track as ended
    pub fn end(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }
}

impl Drop for VideoTrackWriter {
    fn drop(&mut self) {
        self.ended.send_replace(true);
    }
}

/// Read side of an audio track
///
/// The PCM stream can be taken exactly once; clones share it.
#[derive(Clone)]
pub struct AudioTrack {
    label: Arc<str>,
    sample_rate: u32,
    channels: u16,
    stream: Arc<Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>>,
    ended: watch::Receiver<bool>,
}

/// Write side of an audio track
pub struct AudioTrackWriter {
    tx: mpsc::UnboundedSender<AudioChunk>,
    ended: watch::Sender<bool>,
    sample_rate: u32,
    channels: u16,
}

/// Create a connected audio track pair
pub fn audio_track(
    label: impl Into<String>,
    sample_rate: u32,
    channels: u16,
) -> (AudioTrackWriter, AudioTrack) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ended_tx, ended_rx) = watch::channel(false);
    let label: String = label.into();
    (
        AudioTrackWriter {
            tx,
            ended: ended_tx,
            sample_rate,
            channels,
        },
        AudioTrack {
            label: Arc::from(label),
            sample_rate,
            channels,
            stream: Arc::new(Mutex::new(Some(rx))),
            ended: ended_rx,
        },
    )
}

impl AudioTrack {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Take the PCM stream. Fails if another consumer already took it.
    pub fn take_stream(&self) -> Result<mpsc::UnboundedReceiver<AudioChunk>, TrackError> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| TrackError::AlreadyConsumed(self.label.to_string()))
    }

    pub fn is_consumed(&self) -> bool {
        self.stream.lock().is_none()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }
}

impl AudioTrackWriter {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Push interleaved samples in the track's format.
    /// Returns false once nobody is listening anymore.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(AudioChunk {
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn end(&self) {
        self.ended.send_replace(true);
    }
}

impl Drop for AudioTrackWriter {
    fn drop(&mut self) {
        self.ended.send_replace(true);
    }
}

/// What kind of device a source was acquired from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Display,
    Camera,
    Microphone,
    SystemAudio,
    Playback,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Display => write!(f, "display"),
            SourceKind::Camera => write!(f, "camera"),
            SourceKind::Microphone => write!(f, "microphone"),
            SourceKind::SystemAudio => write!(f, "system-audio"),
            SourceKind::Playback => write!(f, "playback"),
        }
    }
}

/// Releases the device behind a source (kills a capture process, stops a stream)
pub trait SourceControl: Send + Sync {
    fn stop(&self);
}

/// A possibly multi-track stream handle acquired from a capability provider
pub struct MediaSource {
    id: Uuid,
    label: String,
    kind: SourceKind,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    controls: Vec<Box<dyn SourceControl>>,
    stopped: AtomicBool,
}

impl MediaSource {
    pub fn new(kind: SourceKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            kind,
            video: None,
            audio: None,
            controls: Vec::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_video(mut self, track: VideoTrack) -> Self {
        self.video = Some(track);
        self
    }

    pub fn with_audio(mut self, track: AudioTrack) -> Self {
        self.audio = Some(track);
        self
    }

    /// Attach a device release handle. Sources built from several devices
    /// carry one per device; all run on stop.
    pub fn with_control(mut self, control: impl SourceControl + 'static) -> Self {
        self.controls.push(Box::new(control));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn video(&self) -> Option<&VideoTrack> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&AudioTrack> {
        self.audio.as_ref()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Number of audio channels this source yields (0 without audio)
    pub fn audio_channel_count(&self) -> u16 {
        self.audio.as_ref().map(|a| a.channels()).unwrap_or(0)
    }

    /// A source is active until stopped or until every track has ended
    pub fn is_active(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let video_live = self.video.as_ref().map(|v| !v.is_ended()).unwrap_or(false);
        let audio_live = self.audio.as_ref().map(|a| !a.is_ended()).unwrap_or(false);
        video_live || audio_live
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Release the underlying device. Returns false if it was already released.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for control in &self.controls {
            control.stop();
        }
        tracing::debug!("Released {} source '{}'", self.kind, self.label);
        true
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        if !self.is_stopped() {
            tracing::debug!("Dropping active {} source, releasing", self.kind);
            self.stop();
        }
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("has_video", &self.has_video())
            .field("audio_channels", &self.audio_channel_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
