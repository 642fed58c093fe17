//! Error types for testbed-state

use thiserror::Error;

/// Errors raised while recording results.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The backing file or stream could not be written
    #[error("result sink i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink refused the record
    #[error("result sink rejected record: {0}")]
    Rejected(String),
}

/// Result type for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;
