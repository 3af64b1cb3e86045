//! Bridge error types.

use thiserror::Error;

/// Errors raised by the platform bridge and its storage backends.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The remote copy diverged from the one the change was based on.
    #[error("Conflict on {resource} {id}: {message}")]
    Conflict {
        resource: String,
        id: String,
        message: String,
    },

    /// The remote record does not exist.
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// Payload rejected before it reached the remote side.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport-level failure that did not come from the HTTP client.
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API returned a non-success status.
    #[error("Remote error: {status} - {message}")]
    Status { status: u16, message: String },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the remote side rejected the change because of divergent data.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BridgeError::Conflict { .. })
    }

    /// Whether the failure is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transport(_) | BridgeError::Http(_) | BridgeError::Io(_) => true,
            BridgeError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }
}

/// Result type alias using BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_error_display() {
        let err = BridgeError::Conflict {
            resource: "patient".to_string(),
            id: "p-1".to_string(),
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Conflict on patient p-1: version mismatch");
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_retryability() {
        let server = BridgeError::Status {
            status: 503,
            message: "unavailable".to_string(),
        };
        let throttled = BridgeError::Status {
            status: 429,
            message: "slow down".to_string(),
        };
        let client = BridgeError::Status {
            status: 400,
            message: "bad request".to_string(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!client.is_retryable());
    }

    #[test]
    fn json_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{{{").unwrap_err();
        let err: BridgeError = serde_err.into();
        assert!(err.to_string().starts_with("JSON error:"));
    }
}
