//! Recording system module
//!
//! This module implements the recording pipeline:
//! - CaptureSession drives one recording from acquisition to artifact
//! - RecorderController keeps a single session alive and owns the camera
//! - ChunkStore persists encoder output in order, to disk or memory

pub mod chunks;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod session;
pub mod state;


pub use chunks::{ChunkStore, PersistenceMode};
pub use controller::RecorderController;
pub use encoder::{EncoderFactory, EncoderSink, FormatProbe, RecordingFormat};
pub use error::{RecordingError, RecordingResult};
pub use session::{
    CancelReason, CaptureSession, EncodingServices, RecordingEvent, SessionSignal, StartOutcome,
};
pub use state::{ArtifactInfo, RecordedArtifact, RecordingConfig, SessionState};
