//! JSON-lines result sink.
//!
//! Each session open, result, and session close becomes one line of JSON in
//! an append-only file. A line is serialized completely before it is
//! written, and written with a single `write_all` while holding the file
//! lock, so concurrent host workers never interleave partial records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SinkResult;
use crate::record::{ExecutionResult, Session, SessionSummary};
use crate::sink::ResultSink;

/// One line of the results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalLine {
    SessionOpened(Session),
    Result(ExecutionResult),
    SessionClosed(SessionSummary),
}

/// Append-only JSON-lines sink.
#[derive(Debug)]
pub struct JsonlResultSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlResultSink {
    /// Open (creating if needed) `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every line of a results file.
    pub async fn read_all(path: impl AsRef<Path>) -> SinkResult<Vec<JournalLine>> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut lines = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            lines.push(serde_json::from_str(line)?);
        }
        Ok(lines)
    }

    async fn append(&self, line: &JournalLine) -> SinkResult<()> {
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), bytes = buf.len(), "appended result line");
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlResultSink {
    async fn open_session(&self, session: &Session) -> SinkResult<()> {
        self.append(&JournalLine::SessionOpened(session.clone())).await
    }

    async fn record(&self, result: &ExecutionResult) -> SinkResult<()> {
        self.append(&JournalLine::Result(result.clone())).await
    }

    async fn close_session(&self, summary: &SessionSummary) -> SinkResult<()> {
        self.append(&JournalLine::SessionClosed(summary.clone())).await
    }
}
