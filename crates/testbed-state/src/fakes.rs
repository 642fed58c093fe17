//! In-memory fakes for the sink trait (testing only)

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{SinkError, SinkResult};
use crate::record::{ExecutionResult, Session, SessionSummary};
use crate::sink::ResultSink;

/// In-memory sink keeping every session and result it was given.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    sessions: Mutex<Vec<Session>>,
    results: Mutex<Vec<ExecutionResult>>,
    summaries: Mutex<Vec<SessionSummary>>,
    reject_records: bool,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `record` always fails, for exercising error paths.
    pub fn rejecting() -> Self {
        Self {
            reject_records: true,
            ..Self::default()
        }
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<ExecutionResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.summaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn open_session(&self, session: &Session) -> SinkResult<()> {
        self.sessions.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn record(&self, result: &ExecutionResult) -> SinkResult<()> {
        if self.reject_records {
            return Err(SinkError::Rejected(format!(
                "refusing result for {}/{}",
                result.host, result.alias
            )));
        }
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn close_session(&self, summary: &SessionSummary) -> SinkResult<()> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}
