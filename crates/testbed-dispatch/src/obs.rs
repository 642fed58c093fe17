//! Structured lifecycle events for orchestrator runs.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=assignment.finished outcome=timeout`.

use tracing::{info, warn};

use testbed_state::{Outcome, SessionSummary};

/// Emit event: session opened for a batch of jobs.
pub fn emit_session_opened(session_id: &str, label: &str, jobs: &[String], assignments: usize) {
    info!(
        event = "session.opened",
        session_id = %session_id,
        label = %label,
        jobs = %jobs.join(","),
        assignments = assignments,
    );
}

/// Emit event: an assignment handed to its host worker's executor.
pub fn emit_assignment_dispatched(session_id: &str, host: &str, job: &str, alias: &str) {
    info!(
        event = "assignment.dispatched",
        session_id = %session_id,
        host = %host,
        job = %job,
        alias = %alias,
    );
}

/// Emit event: an assignment reached its terminal state.
pub fn emit_assignment_finished(
    session_id: &str,
    host: &str,
    job: &str,
    alias: &str,
    outcome: Outcome,
    duration_ms: u64,
) {
    info!(
        event = "assignment.finished",
        session_id = %session_id,
        host = %host,
        job = %job,
        alias = %alias,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: connecting to an agent failed and will be retried.
pub fn emit_connect_retry(host: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "agent.connect_retry",
        host = %host,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

/// Emit event: the result sink refused a record. The run continues.
pub fn emit_sink_error(session_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sink.error", session_id = %session_id, error = %error);
}

/// Emit event: session closed with its final tally.
pub fn emit_session_closed(summary: &SessionSummary) {
    info!(
        event = "session.closed",
        session_id = %summary.id,
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.errors,
        timeouts = summary.timeouts,
        aborted = summary.aborted,
    );
}
