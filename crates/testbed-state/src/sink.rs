//! Result sink trait.
//!
//! The orchestrator hands every terminal `ExecutionResult` to a sink. Sinks
//! must accept concurrent writes from several host workers and make each
//! write atomic (a record is either fully stored or not at all). They are
//! not required to order writes relative to each other.
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;

use crate::error::SinkResult;
use crate::record::{ExecutionResult, Session, SessionSummary};

/// Append-only recorder of execution results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Called once before the first result of a session.
    async fn open_session(&self, _session: &Session) -> SinkResult<()> {
        Ok(())
    }

    /// Store one result. Failing here never aborts the run.
    async fn record(&self, result: &ExecutionResult) -> SinkResult<()>;

    /// Called once after every assignment of the session is terminal.
    async fn close_session(&self, _summary: &SessionSummary) -> SinkResult<()> {
        Ok(())
    }
}
