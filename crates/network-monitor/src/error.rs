//! Network monitor error types.

use thiserror::Error;

/// Probe failure.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Probe did not answer within the timeout
    #[error("Probe {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Probe endpoint could not be reached
    #[error("Probe {endpoint} failed: {message}")]
    Unreachable { endpoint: String, message: String },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using NetworkError.
pub type NetworkResult<T> = Result<T, NetworkError>;
