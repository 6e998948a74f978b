//! Client error types

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the sync layer
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure talking to the server
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Mirror persistence failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Mirror file (de)serialization failure
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The server no longer knows the job
    #[error("Job not found on server: {0}")]
    NotFound(Uuid),

    /// Unexpected server response
    #[error("Server returned status {status}")]
    Server { status: u16 },
}
