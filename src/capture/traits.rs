//! Capture trait definitions
//!
//! Platform-agnostic capability providers. The recorder only ever talks to
//! these traits; real implementations live next to this module and fakes
//! back the tests.

use super::media::MediaSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors a capability provider can report while acquiring
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Explicit opt-out at a prompt. Not a failure.
    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

/// Result type for acquisition
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// What to capture from the display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRequest {
    /// Platform display identifier (e.g. ":0.0" on X11), None = primary
    pub display_id: Option<String>,

    /// Capture width in pixels
    pub width: u32,

    /// Capture height in pixels
    pub height: u32,

    /// Frames per second requested from the grabber
    pub frame_rate: u32,

    /// Attach the display's system audio as an audio track
    pub capture_audio: bool,
}

/// Camera request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConstraints {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            width: 320,
            height: 320,
            frame_rate: 30,
        }
    }
}

/// Microphone request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrophoneConstraints {
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MicrophoneConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: 48000,
            channels: 1,
        }
    }
}

#[async_trait]
pub trait DisplayProvider: Send + Sync {
    /// Ask for the screen. The user may refuse (`UserCancelled`).
    async fn acquire_display(&self, request: &DisplayRequest) -> AcquireResult<MediaSource>;
}

#[async_trait]
pub trait CameraProvider: Send + Sync {
    async fn acquire_camera(&self, constraints: &CameraConstraints) -> AcquireResult<MediaSource>;
}

#[async_trait]
pub trait MicrophoneProvider: Send + Sync {
    async fn acquire_microphone(
        &self,
        constraints: &MicrophoneConstraints,
    ) -> AcquireResult<MediaSource>;
}

/// An incremental write target for recorded chunks
#[async_trait]
pub trait WritableSink: Send {
    /// Where the data ends up
    fn location(&self) -> &Path;

    /// Append one chunk
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;

    /// Flush and close, returning the finalized file
    async fn close(&mut self) -> std::io::Result<PathBuf>;
}

#[async_trait]
pub trait SaveDestinationProvider: Send + Sync {
    /// Negotiate a direct-to-disk target.
    ///
    /// `Ok(None)` means no target is available and the caller should buffer
    /// in memory; `Err(UserCancelled)` aborts the recording.
    async fn negotiate(&self, suggested_name: &str) -> AcquireResult<Option<Box<dyn WritableSink>>>;
}

/// Overlay center in UI space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OverlayPosition {
    pub x: f64,
    pub y: f64,
}

/// UI viewport size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

/// Polled once per composited frame, must be side-effect free
pub trait OverlayPositionProvider: Send + Sync {
    fn position(&self) -> OverlayPosition;
}

/// Polled once per composited frame
pub trait ViewportProvider: Send + Sync {
    fn viewport(&self) -> Option<ViewportSize>;
}

/// Position shared with whatever moves the bubble around
#[derive(Debug, Clone, Default)]
pub struct SharedOverlayPosition {
    inner: Arc<Mutex<OverlayPosition>>,
}

impl SharedOverlayPosition {
    pub fn new(position: OverlayPosition) -> Self {
        Self {
            inner: Arc::new(Mutex::new(position)),
        }
    }

    pub fn set(&self, position: OverlayPosition) {
        *self.inner.lock() = position;
    }
}

impl OverlayPositionProvider for SharedOverlayPosition {
    fn position(&self) -> OverlayPosition {
        *self.inner.lock()
    }
}

/// Viewport shared with the window that hosts the preview
#[derive(Debug, Clone, Default)]
pub struct SharedViewport {
    inner: Arc<Mutex<Option<ViewportSize>>>,
}

impl SharedViewport {
    pub fn new(viewport: Option<ViewportSize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(viewport)),
        }
    }

    pub fn set(&self, viewport: Option<ViewportSize>) {
        *self.inner.lock() = viewport;
    }
}

impl ViewportProvider for SharedViewport {
    fn viewport(&self) -> Option<ViewportSize> {
        *self.inner.lock()
    }
}
