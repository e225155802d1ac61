//! Error types for coordination operations
//!
//! Every fallible operation in the crate returns [`CoordinationResult`]. The
//! variants separate conditions a caller is expected to handle (contention,
//! cancellation) from misconfiguration and backend failures.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Error types for locks, services, cache and throttling
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A `*_no_wait` acquisition found the resource held in a conflicting mode
    #[error("Lock '{0}' is not available")]
    LockUnavailable(String),

    /// The caller's cancellation token fired while blocked
    #[error("Operation interrupted")]
    Interrupted,

    /// Misconfiguration or misuse (already-active service, unknown throttle group, ...)
    #[error("Setup error: {0}")]
    Setup(String),

    /// A quota that can never be satisfied with the current configuration
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Lock nesting that cannot be honoured, e.g. a write lock inside a read lock
    #[error("Illegal lock sequence on '{key}': {message}")]
    IllegalSequence { key: String, message: String },

    /// Backend state could not be decoded
    #[error("Coordination state for '{name}' is corrupt: {message}")]
    Corrupt { name: String, message: String },

    /// IO error from a file-based backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Status encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    pub(crate) fn illegal(key: &str, message: impl Into<String>) -> Self {
        CoordinationError::IllegalSequence {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(name: &str, message: impl Into<String>) -> Self {
        CoordinationError::Corrupt {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Check if error is transient and the operation may be retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::LockUnavailable(_) | CoordinationError::Io(_)
        )
    }

    /// Check if error came from cancellation; these must be propagated, never swallowed
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CoordinationError::Interrupted)
    }

    /// Get suggested retry delay for transient errors
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            CoordinationError::LockUnavailable(_) => Some(Duration::from_millis(10)),
            CoordinationError::Io(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }
}
