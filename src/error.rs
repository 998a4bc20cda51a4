//! Error types for the workspace-sync library.
//!
//! Remote failures surface here only for explicit sync requests; the
//! optimistic write path logs them and keeps going.

use thiserror::Error;

/// Errors that can occur in the workspace-sync library.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store (sled) errors
    #[error("Local store error: {0}")]
    Store(#[from] sled::Error),

    /// Binary encoding of cached records failed
    #[error("Record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level failure talking to the remote source
    #[error("Remote {operation} failed: {message}")]
    Remote {
        /// Remote operation that failed
        operation: &'static str,
        /// Underlying transport error
        message: String,
    },

    /// Remote source answered with a non-success status
    #[error("Remote returned {status}: {body}")]
    RemoteStatus {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Remote call exceeded the configured timeout
    #[error("Remote {0} timed out")]
    Timeout(&'static str),

    /// Record not found in local state or store
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind ("channel", "message", ...)
        kind: &'static str,
        /// Requested id
        id: String,
    },

    /// Caller supplied invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote source does not offer this operation
    #[error("Remote source does not support {0}")]
    Unsupported(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::RemoteStatus {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        Self::Remote {
            operation: "request",
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl SyncError {
    /// Build a [`SyncError::NotFound`] for a channel id
    pub fn channel_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "channel",
            id: id.into(),
        }
    }

    /// Build a [`SyncError::NotFound`] for a message id
    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "message",
            id: id.into(),
        }
    }

    /// True for failures that originate at the remote source
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Remote { .. } | Self::RemoteStatus { .. } | Self::Timeout(_)
        )
    }
}
