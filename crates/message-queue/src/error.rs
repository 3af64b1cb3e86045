//! Message queue error types.

use thiserror::Error;

/// Message queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Rejected at enqueue time
    #[error("Invalid message: {0}")]
    Invalid(String),

    /// Storage or bridge error
    #[error("Bridge error: {0}")]
    Bridge(#[from] platform_bridge::BridgeError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background loop already running
    #[error("Message queue loop already started")]
    AlreadyStarted,
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
