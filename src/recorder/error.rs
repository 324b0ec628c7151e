//! Recording errors

use crate::capture::traits::AcquireError;
use thiserror::Error;

/// Errors that can occur while recording
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Invalid state: cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("Encoder error: {0}")]
    EncoderFatal(String),

    #[error("No supported recording format")]
    FormatUnavailable,

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Capture error: {0}")]
    Capture(#[from] AcquireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RecordingError {
    /// Whether this error should be shown to the user
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            RecordingError::EncoderFatal(_) | RecordingError::FormatUnavailable
        )
    }
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;
