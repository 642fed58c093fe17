//! Testbed-State: result records and sinks for the testbed orchestrator
//!
//! The orchestrator's only storage obligation is to produce well-formed
//! records; this crate defines their shape and the narrow write interface.
//!
//! ## Key Components
//!
//! - `ExecutionResult`: terminal outcome of one assignment
//! - `Session` / `SessionSummary`: grouping of one orchestrator run
//! - `ResultSink`: append-only, concurrency-safe write interface
//! - `JsonlResultSink`: JSON-lines file backend
//! - `fakes::MemoryResultSink`: in-memory backend for tests

mod error;
pub mod fakes;
pub mod jsonl;
pub mod record;
pub mod sink;

pub use error::{SinkError, SinkResult};
pub use jsonl::{JournalLine, JsonlResultSink};
pub use record::{
    ArtifactEntry, ExecutionResult, Failure, FailureKind, HostId, Outcome, Session, SessionId,
    SessionSummary, DEFAULT_SESSION_LABEL,
};
pub use sink::ResultSink;
