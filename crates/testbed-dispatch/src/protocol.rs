//! Remote Execution Protocol.
//!
//! Messages are JSON documents carried in length-prefixed frames:
//!
//! ```text
//! +----------------+------------------------+
//! | Length (4B BE) | JSON payload (Length B) |
//! +----------------+------------------------+
//! ```
//!
//! One request is answered by exactly one response. The protocol is
//! duration-agnostic: a long-running `Execute` simply keeps the response
//! outstanding, and the orchestrator bounds the wait.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use testbed_state::{ArtifactEntry, FailureKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Agent version string reported by `Pong`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest payload either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes kept free in a frame for the response envelope around an
/// [`ExecuteResponse`].
pub const ENVELOPE_SLACK: usize = 4 * 1024;

/// Orchestrator → agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Stage(StageRequest),
    Execute(ExecuteRequest),
    Cleanup(CleanupRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Stage(_) => "stage",
            Request::Execute(_) => "execute",
            Request::Cleanup(_) => "cleanup",
        }
    }
}

/// Agent → orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong { version: String, hostname: String },
    Staged {
        assignment_id: Uuid,
        manifest: Vec<ArtifactEntry>,
    },
    Executed(ExecuteResponse),
    CleanedUp { assignment_id: Uuid },
    Error(ErrorResponse),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Pong { .. } => "pong",
            Response::Staged { .. } => "staged",
            Response::Executed(_) => "executed",
            Response::CleanedUp { .. } => "cleaned_up",
            Response::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRequest {
    pub assignment_id: Uuid,
    /// Absolute directory on the agent host
    pub destination: String,
    pub artifacts: Vec<ArtifactPayload>,
}

/// One artifact in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub name: String,
    pub file_name: String,
    pub sha256: String,
    pub content_hex: String,
}

impl ArtifactPayload {
    pub fn from_bytes(name: impl Into<String>, file_name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            sha256: sha256_hex(bytes),
            content_hex: hex::encode(bytes),
        }
    }

    /// Decode the content and check it against the declared digest.
    pub fn decode(&self) -> Result<Vec<u8>, String> {
        let bytes = hex::decode(&self.content_hex)
            .map_err(|e| format!("artifact {}: bad encoding: {e}", self.name))?;
        let actual = sha256_hex(&bytes);
        if actual != self.sha256 {
            return Err(format!(
                "artifact {}: digest mismatch (expected {}, got {actual})",
                self.name, self.sha256
            ));
        }
        Ok(bytes)
    }

    /// Bytes this payload occupies on the wire, roughly.
    pub fn encoded_len(&self) -> usize {
        self.content_hex.len() + self.sha256.len() + self.name.len() + self.file_name.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub assignment_id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    /// Relative paths are taken relative to the staging directory
    pub working_dir: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub assignment_id: Uuid,
    pub exit_status: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub duration_ms: u64,
    /// Output was lost: a stream failed, outlived the process, or was cut
    /// down to fit the frame
    pub degraded: bool,
    pub timed_out: bool,
    /// Files generated in the working directory
    pub artifacts: Vec<ArtifactEntry>,
    /// Oldest output lines removed by [`ExecuteResponse::fit_within`]
    #[serde(default)]
    pub dropped_lines: u64,
    /// Streams that failed to read
    #[serde(default)]
    pub reader_failures: Vec<String>,
}

impl ExecuteResponse {
    /// Drop the oldest output lines until the encoded response is at most
    /// `limit` bytes. The newest lines of each stream are kept; stderr gets
    /// at most half of the output budget.
    pub fn fit_within(&mut self, limit: usize) -> ProtocolResult<()> {
        let mut budget = limit;
        loop {
            let size = serde_json::to_vec(self)?.len();
            if size <= limit {
                return Ok(());
            }
            if self.stdout.is_empty() && self.stderr.is_empty() {
                return Err(ProtocolError::FrameTooLarge { size, limit });
            }
            budget /= 2;
            let mut dropped = keep_tail(&mut self.stderr, budget / 2);
            let stderr_len = lines_len(&self.stderr);
            dropped += keep_tail(&mut self.stdout, budget.saturating_sub(stderr_len));
            self.dropped_lines += dropped;
            self.degraded = true;
        }
    }
}

/// Encoded size of `lines`, counting quotes and separators.
fn lines_len(lines: &[String]) -> usize {
    lines.iter().map(|l| l.len() + 3).sum()
}

/// Keep the newest lines that fit in `budget` bytes; returns how many were
/// dropped.
fn keep_tail(lines: &mut Vec<String>, budget: usize) -> u64 {
    let mut used = 0usize;
    let mut keep = 0usize;
    for line in lines.iter().rev() {
        used += line.len() + 3;
        if used > budget {
            break;
        }
        keep += 1;
    }
    let dropped = lines.len() - keep;
    lines.drain(..dropped);
    dropped as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub assignment_id: Uuid,
    pub path: String,
}

/// Failure reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            code: error_code(kind),
            kind,
            message: message.into(),
        }
    }
}

/// Stable numeric code for each failure class.
pub fn error_code(kind: FailureKind) -> u16 {
    match kind {
        FailureKind::Staging => 10,
        FailureKind::Connection => 20,
        FailureKind::Launch => 30,
        FailureKind::Reader => 40,
        FailureKind::Timeout => 50,
        FailureKind::Aborted => 60,
        FailureKind::Protocol => 70,
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write one framed message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> ProtocolResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Closed
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
