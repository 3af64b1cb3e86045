//! Orchestrator error types.

use thiserror::Error;

/// Orchestrator error type.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// start() called twice
    #[error("Orchestrator already started")]
    AlreadyStarted,

    /// Message queue error
    #[error("Message queue error: {0}")]
    Queue(#[from] message_queue::QueueError),

    /// Sync queue error
    #[error("Sync queue error: {0}")]
    Sync(#[from] sync_queue::SyncError),

    /// Probe client construction failed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias using OrchestratorError.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
