//! Error types for the dispatch layer.

use std::time::Duration;

use testbed_state::FailureKind;

use crate::driver::DriverOutput;

/// Errors produced by the Subprocess Driver.
///
/// A stream that fails to read is not an error here; it is reported in
/// [`DriverOutput::reader_failures`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {}ms", timeout.as_millis())]
    TimeoutExceeded {
        timeout: Duration,
        /// Output collected before the process was killed
        output: Box<DriverOutput>,
    },
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors on the wire between orchestrator and agent.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("unexpected response to {request}: {got}")]
    Unexpected { request: &'static str, got: String },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the agent while serving one request.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("staging failed: {0}")]
    Staging(String),

    #[error("path {0} is outside the agent root")]
    OutsideRoot(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("response cannot be sent: {0}")]
    Oversized(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Launch(_) => FailureKind::Launch,
            AgentError::Oversized(_) => FailureKind::Protocol,
            AgentError::Staging(_) | AgentError::OutsideRoot(_) | AgentError::Io(_) => {
                FailureKind::Staging
            }
        }
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Why a single assignment did not produce a normal result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("staging failed: {0}")]
    Staging(String),

    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("aborted")]
    Aborted,
}

impl DispatchError {
    /// Serializable classification recorded on the Execution Result.
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::Staging(_) => FailureKind::Staging,
            DispatchError::Connection { .. } => FailureKind::Connection,
            DispatchError::Launch(_) => FailureKind::Launch,
            DispatchError::Timeout(_) => FailureKind::Timeout,
            DispatchError::Protocol(_) => FailureKind::Protocol,
            DispatchError::Aborted => FailureKind::Aborted,
        }
    }

    /// Only connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Connection { .. })
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
