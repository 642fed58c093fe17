//! Remote executor: drives one assignment through an agent.
//!
//! Sequence per assignment: read artifacts locally, connect (with retry),
//! `Stage`, `Execute` bounded by timeout plus grace, best-effort `Cleanup`.
//! Whatever happens, the caller gets exactly one [`ExecutionResult`].

use std::sync::Arc;

use chrono::Utc;
use testbed_core::{ArtifactSource, Assignment, RunConfig};
use testbed_state::{ExecutionResult, Failure, FailureKind, HostId, Outcome, SessionId};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::abort::AbortSignal;
use crate::connector::{AgentConnector, AgentSession};
use crate::error::{DispatchError, DispatchResult, ProtocolError};
use crate::obs::emit_connect_retry;
use crate::protocol::{
    ArtifactPayload, CleanupRequest, ErrorResponse, ExecuteRequest, ExecuteResponse, Request,
    Response, StageRequest, MAX_FRAME_LEN,
};

/// Room left in a frame for everything that is not artifact content.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Executes assignments on agents reached through a connector.
pub struct RemoteExecutor {
    connector: Arc<dyn AgentConnector>,
    config: Arc<RunConfig>,
}

impl RemoteExecutor {
    pub fn new(connector: Arc<dyn AgentConnector>, config: Arc<RunConfig>) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run `assignment` to completion.
    pub async fn dispatch(&self, session_id: SessionId, assignment: &Assignment) -> ExecutionResult {
        self.dispatch_abortable(session_id, assignment, AbortSignal::never())
            .await
    }

    /// Run `assignment`, giving up as soon as `abort` fires. An in-flight
    /// connection is dropped on abort, which makes the agent kill the
    /// process.
    #[instrument(
        skip(self, assignment, abort),
        fields(host = %assignment.host, job = %assignment.job, alias = %assignment.alias)
    )]
    pub async fn dispatch_abortable(
        &self,
        session_id: SessionId,
        assignment: &Assignment,
        mut abort: AbortSignal,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempts = 0u32;

        let outcome = tokio::select! {
            r = self.try_dispatch(assignment, &mut attempts) => r,
            _ = abort.aborted() => Err(DispatchError::Aborted),
        };

        let mut result = ExecutionResult {
            session_id,
            assignment_id: assignment.id,
            host: assignment.host.clone(),
            job: assignment.job.clone(),
            alias: assignment.alias.clone(),
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            exit_status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            outcome: Outcome::Error,
            failure: None,
            degraded: false,
            attempts,
            artifacts: Vec::new(),
            dropped_lines: 0,
        };

        match outcome {
            Ok(response) => self.apply_response(&mut result, assignment, response),
            Err(error) => {
                debug!(error = %error, "assignment failed");
                result.outcome = error.kind().outcome();
                result.failure = Some(Failure::new(error.kind(), error.to_string()));
            }
        }
        result
    }

    /// The result of an assignment that never started because the run was
    /// aborted first.
    pub fn not_started(&self, session_id: SessionId, assignment: &Assignment) -> ExecutionResult {
        ExecutionResult {
            session_id,
            assignment_id: assignment.id,
            host: assignment.host.clone(),
            job: assignment.job.clone(),
            alias: assignment.alias.clone(),
            started_at: Utc::now(),
            duration_ms: 0,
            exit_status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            outcome: Outcome::Aborted,
            failure: Some(Failure::new(
                FailureKind::Aborted,
                "aborted before dispatch",
            )),
            degraded: false,
            attempts: 0,
            artifacts: Vec::new(),
            dropped_lines: 0,
        }
    }

    fn apply_response(
        &self,
        result: &mut ExecutionResult,
        assignment: &Assignment,
        response: ExecuteResponse,
    ) {
        result.exit_status = response.exit_status;
        result.stdout = response.stdout;
        result.stderr = response.stderr;
        result.duration_ms = response.duration_ms;
        result.degraded = response.degraded;
        result.artifacts = response.artifacts;
        result.dropped_lines = response.dropped_lines;

        // A stream cut off after exit or trimmed to fit is degraded but
        // still classified by exit status; only a failed read is an error.
        if response.timed_out {
            result.outcome = Outcome::Timeout;
            result.failure = Some(Failure::new(
                FailureKind::Timeout,
                format!("exceeded {}s timeout", assignment.timeout.as_secs()),
            ));
        } else if !response.reader_failures.is_empty() {
            result.degraded = true;
            result.outcome = Outcome::Error;
            result.failure = Some(Failure::new(
                FailureKind::Reader,
                response.reader_failures.join("; "),
            ));
        } else {
            result.outcome = self.config.outcome.classify(response.exit_status);
        }
    }

    async fn try_dispatch(
        &self,
        assignment: &Assignment,
        attempts: &mut u32,
    ) -> DispatchResult<ExecuteResponse> {
        let artifacts = read_artifacts(&assignment.artifacts).await?;
        let mut session = self.connect_with_retry(&assignment.host, attempts).await?;

        let destination = self
            .config
            .constants
            .root
            .join(assignment.id.to_string())
            .display()
            .to_string();

        let staged = session
            .call(&Request::Stage(StageRequest {
                assignment_id: assignment.id,
                destination: destination.clone(),
                artifacts,
            }))
            .await
            .map_err(|e| wire_error(&assignment.host, e))?;
        match staged {
            Response::Staged { manifest, .. } => {
                debug!(artifacts = manifest.len(), "staged");
            }
            other => {
                // Staging may have stopped halfway; remove what it wrote.
                let error = unexpected("stage", other);
                cleanup(session.as_mut(), assignment, destination).await;
                return Err(error);
            }
        }

        let executed = self.execute(session.as_mut(), assignment).await;
        if !matches!(
            executed,
            Err(DispatchError::Timeout(_) | DispatchError::Connection { .. })
        ) {
            cleanup(session.as_mut(), assignment, destination).await;
        }
        executed
    }

    async fn execute(
        &self,
        session: &mut dyn AgentSession,
        assignment: &Assignment,
    ) -> DispatchResult<ExecuteResponse> {
        let request = Request::Execute(ExecuteRequest {
            assignment_id: assignment.id,
            command: assignment.command.clone(),
            args: assignment.args.clone(),
            working_dir: assignment.working_dir.clone(),
            timeout_ms: assignment.timeout.as_millis() as u64,
        });

        let limit = assignment.timeout + self.config.dispatch_grace;
        let response = tokio::time::timeout(limit, session.call(&request))
            .await
            .map_err(|_| DispatchError::Timeout(assignment.timeout))?
            .map_err(|e| wire_error(&assignment.host, e))?;

        match response {
            Response::Executed(executed) => Ok(executed),
            other => Err(unexpected("execute", other)),
        }
    }

    async fn connect_with_retry(
        &self,
        host: &HostId,
        attempts: &mut u32,
    ) -> DispatchResult<Box<dyn AgentSession>> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        loop {
            *attempts += 1;
            match self.connector.connect(host).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_retryable() && *attempts < max_attempts => {
                    let delay = policy.delay_after(*attempts);
                    emit_connect_retry(host.as_str(), *attempts, delay.as_millis() as u64, &e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn cleanup(session: &mut dyn AgentSession, assignment: &Assignment, path: String) {
    let request = Request::Cleanup(CleanupRequest {
        assignment_id: assignment.id,
        path,
    });
    match session.call(&request).await {
        Ok(Response::CleanedUp { .. }) => {}
        Ok(other) => warn!(response = other.name(), "cleanup not confirmed"),
        Err(e) => warn!(error = %e, "cleanup failed"),
    }
}

/// Load every artifact into memory. Any failure here means the assignment
/// is never executed.
async fn read_artifacts(sources: &[ArtifactSource]) -> DispatchResult<Vec<ArtifactPayload>> {
    let mut payloads = Vec::with_capacity(sources.len());
    let mut total = 0usize;
    for source in sources {
        let bytes = tokio::fs::read(&source.path).await.map_err(|e| {
            DispatchError::Staging(format!(
                "artifact {} ({}): {e}",
                source.name,
                source.path.display()
            ))
        })?;
        let payload = ArtifactPayload::from_bytes(&source.name, source.file_name(), &bytes);
        total += payload.encoded_len();
        if total > MAX_FRAME_LEN - FRAME_OVERHEAD {
            return Err(DispatchError::Staging(format!(
                "artifacts exceed the {MAX_FRAME_LEN} byte frame limit at {}",
                source.name
            )));
        }
        payloads.push(payload);
    }
    Ok(payloads)
}

/// A transport failure once a session is open. These are not retried: the
/// request may already have had effects on the agent.
fn wire_error(host: &HostId, error: ProtocolError) -> DispatchError {
    match error {
        ProtocolError::Io(_) | ProtocolError::Closed => DispatchError::Connection {
            host: host.to_string(),
            reason: error.to_string(),
        },
        other => DispatchError::Protocol(other.to_string()),
    }
}

fn unexpected(request: &'static str, response: Response) -> DispatchError {
    match response {
        Response::Error(ErrorResponse { kind, message, .. }) => match kind {
            FailureKind::Staging => DispatchError::Staging(message),
            FailureKind::Launch => DispatchError::Launch(message),
            _ => DispatchError::Protocol(message),
        },
        other => DispatchError::Protocol(
            ProtocolError::Unexpected {
                request,
                got: other.name().to_string(),
            }
            .to_string(),
        ),
    }
}
