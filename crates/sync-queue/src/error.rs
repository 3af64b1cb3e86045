//! Sync queue error types.

use thiserror::Error;

/// Sync queue error type.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Rejected at add time
    #[error("Invalid sync item: {0}")]
    Invalid(String),

    /// Unknown item or conflict id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resolved conflicts are immutable
    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// Merge resolution without a merged payload
    #[error("Merge resolution requires a merged payload")]
    MissingMergedPayload,

    /// Remote apply or storage error
    #[error("Bridge error: {0}")]
    Bridge(#[from] platform_bridge::BridgeError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background loop already running
    #[error("Sync queue loop already started")]
    AlreadyStarted,
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
