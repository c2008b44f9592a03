//! Error types for the photo persistence engine
//!
//! Every failure in the crate is reported as a [`PhotoStorageError`] carrying
//! a closed set of codes, a technical message, an optional underlying cause,
//! and the time the error was raised. UI layers are expected to display
//! [`PhotoStorageError::user_message`] and branch on the recoverability
//! helpers rather than inspecting the technical message.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of failure categories
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhotoStorageErrorCode {
    StorageUnavailable,
    QuotaExceeded,
    PhotoNotFound,
    InvalidFile,
    CompressionFailed,
    StorageCorrupted,
    OperationTimeout,
    InitializationFailed,
    MetadataError,
    UnknownError,
}

impl fmt::Display for PhotoStorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::PhotoNotFound => "PHOTO_NOT_FOUND",
            Self::InvalidFile => "INVALID_FILE",
            Self::CompressionFailed => "COMPRESSION_FAILED",
            Self::StorageCorrupted => "STORAGE_CORRUPTED",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::InitializationFailed => "INITIALIZATION_FAILED",
            Self::MetadataError => "METADATA_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(name)
    }
}

/// The single error type for all storage, compression, and service operations
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct PhotoStorageError {
    pub code: PhotoStorageErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub timestamp: DateTime<Utc>,
}

pub type Result<T> = std::result::Result<T, PhotoStorageError>;

impl PhotoStorageError {
    pub fn new(code: PhotoStorageErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_cause(
        code: PhotoStorageErrorCode,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
            timestamp: Utc::now(),
        }
    }

    pub fn not_found(id: impl fmt::Display) -> Self {
        Self::new(
            PhotoStorageErrorCode::PhotoNotFound,
            format!("photo not found: {}", id),
        )
    }

    /// Fixed, non-technical sentence suitable for direct UI display
    pub fn user_message(&self) -> &'static str {
        match self.code {
            PhotoStorageErrorCode::StorageUnavailable => {
                "Photo storage is not available on this device. Please check available disk space and permissions."
            }
            PhotoStorageErrorCode::QuotaExceeded => {
                "Not enough storage space. Please free up some space and try again."
            }
            PhotoStorageErrorCode::PhotoNotFound => "The requested photo could not be found.",
            PhotoStorageErrorCode::InvalidFile => {
                "This file cannot be stored. Please choose a valid image."
            }
            PhotoStorageErrorCode::CompressionFailed => {
                "The photo could not be processed. Please try again."
            }
            PhotoStorageErrorCode::StorageCorrupted => {
                "Stored photo data appears to be damaged. The photo may need to be re-uploaded."
            }
            PhotoStorageErrorCode::OperationTimeout => {
                "The operation took too long. Please try again."
            }
            PhotoStorageErrorCode::InitializationFailed => {
                "Photo storage could not be started. Please reload and try again."
            }
            PhotoStorageErrorCode::MetadataError => {
                "Photo information could not be updated. Please try again."
            }
            PhotoStorageErrorCode::UnknownError => "Something went wrong. Please try again.",
        }
    }

    /// Whether the operation is a candidate for automatic retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            PhotoStorageErrorCode::OperationTimeout | PhotoStorageErrorCode::CompressionFailed
        )
    }

    /// Whether the caller must surface a remedy to the user instead of retrying
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self.code,
            PhotoStorageErrorCode::QuotaExceeded
                | PhotoStorageErrorCode::StorageUnavailable
                | PhotoStorageErrorCode::InvalidFile
        )
    }

    /// Normalize an arbitrary error into the taxonomy.
    ///
    /// Generic platform errors carry no category of their own, so the closest
    /// code is picked by matching well-known substrings of the message.
    pub fn from_unknown(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        let code = if lowered.contains("quota") || lowered.contains("no space") {
            PhotoStorageErrorCode::QuotaExceeded
        } else if lowered.contains("timeout") || lowered.contains("timed out") {
            PhotoStorageErrorCode::OperationTimeout
        } else {
            PhotoStorageErrorCode::UnknownError
        };
        Self {
            code,
            message,
            cause: Some(Box::new(err)),
            timestamp: Utc::now(),
        }
    }
}

/// Backoff parameters for [`retry_with_backoff`]
#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry an operation with exponential backoff.
///
/// Only recoverable errors are retried; a non-recoverable error aborts
/// immediately. The delay doubles (by `backoff_multiplier`) per attempt,
/// capped at `max_delay`, and the last error is returned once attempts are
/// exhausted.
pub async fn retry_with_backoff<T, F, Fut>(options: RetryOptions, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = options.initial_delay;
    let mut last_error: Option<PhotoStorageError> = None;

    for attempt in 1..=options.max_attempts.max(1) {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_recoverable() {
                    return Err(err);
                }
                log::warn!(
                    "recoverable error on attempt {}/{}: {}",
                    attempt,
                    options.max_attempts,
                    err
                );
                last_error = Some(err);
                if attempt < options.max_attempts {
                    tokio::time::sleep(delay).await;
                    let next = delay.mul_f64(options.backoff_multiplier);
                    delay = next.min(options.max_delay);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        PhotoStorageError::new(PhotoStorageErrorCode::UnknownError, "retry exhausted")
    }))
}
