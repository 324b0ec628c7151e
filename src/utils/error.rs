//! Error types and handling
//!
//! The top-level error the CLI (and any embedding front end) sees. Every
//! subsystem error converts into it and maps onto a stable code.

use crate::capture::traits::AcquireError;
use crate::export::types::TrimError;
use crate::recorder::error::RecordingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Trim error: {0}")]
    Trim(#[from] TrimError),

    #[error("Capture error: {0}")]
    Capture(#[from] AcquireError),
}

impl AppError {
    /// Stable, machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Recording(RecordingError::AlreadyRecording) => "ALREADY_RECORDING",
            AppError::Recording(RecordingError::NotRecording) => "NOT_RECORDING",
            AppError::Recording(RecordingError::InvalidState { .. }) => "INVALID_STATE",
            AppError::Recording(RecordingError::EncoderFatal(_)) => "ENCODER_ERROR",
            AppError::Recording(RecordingError::FormatUnavailable) => "FORMAT_UNAVAILABLE",
            AppError::Recording(RecordingError::Capture(e)) | AppError::Capture(e) => {
                capture_code(e)
            }
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Trim(TrimError::InvalidRange { .. }) => "INVALID_RANGE",
            AppError::Trim(TrimError::AlreadyInFlight) => "TRIM_IN_PROGRESS",
            AppError::Trim(TrimError::SeekFailed(_)) => "SEEK_FAILED",
            AppError::Trim(_) => "EXPORT_ERROR",
        }
    }
}

fn capture_code(error: &AcquireError) -> &'static str {
    match error {
        AcquireError::UserCancelled => "CANCELLED",
        AcquireError::PermissionDenied(_) => "PERMISSION_DENIED",
        AcquireError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
        AcquireError::Capture(_) => "PLATFORM_ERROR",
    }
}

/// Error response for front ends
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes_follow_the_wrapped_error() {
        let err: AppError = RecordingError::FormatUnavailable.into();
        assert_eq!(err.code(), "FORMAT_UNAVAILABLE");

        let err: AppError = RecordingError::Capture(AcquireError::PermissionDenied("mic".into())).into();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let err: AppError = TrimError::SeekFailed(Duration::from_secs(1)).into();
        assert_eq!(err.code(), "SEEK_FAILED");
    }

    #[test]
    fn test_error_response_carries_message() {
        let response = ErrorResponse::from(AppError::from(TrimError::AlreadyInFlight));
        assert_eq!(response.code, "TRIM_IN_PROGRESS");
        assert!(response.message.contains("already running"));
    }
}
