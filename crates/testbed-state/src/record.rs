//! Record shapes produced by the orchestrator.
//!
//! These are the only types a result backend has to understand:
//! - `ExecutionResult`: one terminal outcome per (session, host, assignment)
//! - `Session` / `SessionSummary`: the grouping of one orchestrator run
//!
//! Every record is self-describing (host, job, alias, timestamps) so a sink
//! never has to rely on arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label used for sessions when the caller does not pick one.
pub const DEFAULT_SESSION_LABEL: &str = "pyrering.version";

/// Network address or hostname of a testbed machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(host: impl Into<String>) -> Self {
        HostId(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        HostId(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        HostId(s)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random SessionId
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal classification of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Timeout,
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
            Outcome::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an assignment did not produce a clean pass/fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An artifact could not be read or written on the target
    Staging,
    /// The agent could not be reached (after retries) or dropped the link
    Connection,
    /// The command could not be started
    Launch,
    /// One of the output streams could not be read
    Reader,
    /// The assignment ran past its timeout and was terminated
    Timeout,
    /// Operator or caller cancellation
    Aborted,
    /// The agent answered with something unexpected
    Protocol,
}

impl FailureKind {
    /// Outcome an assignment with this failure is reported as.
    pub fn outcome(&self) -> Outcome {
        match self {
            FailureKind::Timeout => Outcome::Timeout,
            FailureKind::Aborted => Outcome::Aborted,
            _ => Outcome::Error,
        }
    }
}

/// Failure classification plus the human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A file staged onto, or generated on, the target host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub size: u64,
    /// SHA-256 of the content, lowercase hex
    pub sha256: String,
}

/// One terminal result for one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: SessionId,
    pub assignment_id: Uuid,
    pub host: HostId,
    pub job: String,
    pub alias: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Exit code of the remote process, if it ran to completion
    pub exit_status: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub outcome: Outcome,
    pub failure: Option<Failure>,
    /// True when some output was lost: a stream failed or stayed open
    /// after exit, or old lines were dropped to fit the response
    pub degraded: bool,
    /// Number of connection attempts spent on this assignment
    pub attempts: u32,
    /// Files the command left behind in its working directory
    pub artifacts: Vec<ArtifactEntry>,
    /// Oldest output lines the agent dropped to keep the response in one frame
    #[serde(default)]
    pub dropped_lines: u64,
}

impl ExecutionResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// The (host, alias) pair this result answers for.
    pub fn target(&self) -> (&HostId, &str) {
        (&self.host, self.alias.as_str())
    }
}

/// Opening record of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub label: String,
    pub jobs: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(jobs: Vec<String>) -> Self {
        Self::with_label(DEFAULT_SESSION_LABEL, jobs)
    }

    pub fn with_label(label: impl Into<String>, jobs: Vec<String>) -> Self {
        Self {
            id: SessionId::new(),
            label: label.into(),
            jobs,
            started_at: Utc::now(),
        }
    }
}

/// Closing record of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub aborted: usize,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    /// Start an empty tally for `session`.
    pub fn open(session: &Session) -> Self {
        Self {
            id: session.id,
            label: session.label.clone(),
            total: 0,
            passed: 0,
            failed: 0,
            errors: 0,
            timeouts: 0,
            aborted: 0,
            started_at: session.started_at,
            closed_at: None,
        }
    }

    pub fn observe(&mut self, result: &ExecutionResult) {
        self.total += 1;
        match result.outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::Aborted => self.aborted += 1,
        }
    }

    pub fn close(mut self) -> Self {
        self.closed_at = Some(Utc::now());
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// True when every recorded assignment passed.
    pub fn success(&self) -> bool {
        self.total == self.passed
    }
}
