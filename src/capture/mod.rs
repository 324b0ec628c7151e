//! Media capture
//!
//! Capability-provider traits, the track and source primitives they hand
//! out, and the real providers for each platform.

pub mod audio;
pub mod destination;
pub mod media;
pub mod platform;
pub mod screen;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod webcam;

pub use media::{AudioTrack, MediaSource, SourceKind, VideoFrame, VideoTrack};
pub use platform::{default_providers, CaptureProviders};
pub use traits::{AcquireError, AcquireResult, Resolution};
