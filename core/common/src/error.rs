//! Common error types for Storegate.
//!
//! Every adapter-native failure is classified into one [`Error`] variant at the
//! adapter boundary. Callers only ever see the normalized [`ErrorKind`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Normalized error taxonomy exposed to gateway callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    Throttled,
    Conflict,
    Unavailable,
    InvalidCursor,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidCursor => "invalid_cursor",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for Storegate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Credentials were rejected by the provider.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Provider storage quota exhausted.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Provider asked us to slow down.
    #[error("Throttled: {message}")]
    Throttled {
        message: String,
        /// Delay requested by the provider, if it sent one.
        retry_after: Option<Duration>,
    },

    /// Conflicting state (existing destination, etag mismatch, invalid transition).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient backend outage (5xx).
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Transport-level failure before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// Continuation cursor rejected.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything the adapter could not classify.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Create a throttle error without a provider-supplied delay.
    pub fn throttled(message: impl Into<String>) -> Self {
        Error::Throttled {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Map this error onto the normalized taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) | Error::Authentication(_) => ErrorKind::PermissionDenied,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::Throttled { .. } => ErrorKind::Throttled,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unavailable(_) | Error::Network(_) => ErrorKind::Unavailable,
            Error::InvalidCursor(_) => ErrorKind::InvalidCursor,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_)
            | Error::InvalidInput(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the failure is transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Throttled { .. } | Error::Unavailable(_) | Error::Network(_)
        )
    }

    /// Delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convert an exhausted transient failure into its surfaced form.
    ///
    /// Network failures surface as `Unavailable` once retries run out.
    pub fn into_exhausted(self) -> Self {
        match self {
            Error::Network(msg) => Error::Unavailable(msg),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
