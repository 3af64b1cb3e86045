//! Connection error types.

use thiserror::Error;

/// Connection error type.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected error
    #[error("Connection is not live")]
    NotConnected,

    /// Unknown connection id
    #[error("Connection not found: {0}")]
    NotFound(String),

    /// Connection limit reached
    #[error("Connection limit of {0} reached")]
    LimitReached(usize),

    /// Payload or topic rejected before sending
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Send error
    #[error("Failed to send frame: {0}")]
    Send(String),

    /// Fallback queue error
    #[error("Queue error: {0}")]
    Queue(#[from] message_queue::QueueError),
}

/// Result type alias using ConnectionError.
pub type ConnectionResult<T> = Result<T, ConnectionError>;
