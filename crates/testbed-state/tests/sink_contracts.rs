//! Contract tests for ResultSink implementations.
//!
//! Both the in-memory fake and the JSON-lines file sink must keep every
//! record whole when several host workers write at the same time.

use std::sync::Arc;

use chrono::Utc;
use testbed_state::fakes::MemoryResultSink;
use testbed_state::*;
use uuid::Uuid;

fn result_for(session: &Session, host: &str, alias: &str, outcome: Outcome) -> ExecutionResult {
    ExecutionResult {
        session_id: session.id,
        assignment_id: Uuid::new_v4(),
        host: HostId::from(host),
        job: "ltp".to_string(),
        alias: alias.to_string(),
        started_at: Utc::now(),
        duration_ms: 42,
        exit_status: Some(if outcome == Outcome::Pass { 0 } else { 1 }),
        stdout: vec![format!("{host} line one"), format!("{host} line two")],
        stderr: vec![],
        outcome,
        failure: None,
        degraded: false,
        attempts: 1,
        artifacts: vec![],
        dropped_lines: 0,
    }
}

// ===========================================================================
// MemoryResultSink
// ===========================================================================

#[tokio::test]
async fn memory_sink_keeps_session_lifecycle() {
    let sink = MemoryResultSink::new();
    let session = Session::new(vec!["ltp".to_string()]);

    sink.open_session(&session).await.unwrap();
    let r = result_for(&session, "dapper.lab", "dapper", Outcome::Pass);
    sink.record(&r).await.unwrap();

    let mut summary = SessionSummary::open(&session);
    summary.observe(&r);
    sink.close_session(&summary.close()).await.unwrap();

    assert_eq!(sink.sessions().len(), 1);
    assert_eq!(sink.results(), vec![r]);
    assert!(sink.summaries()[0].is_closed());
}

#[tokio::test]
async fn memory_sink_rejecting_reports_error() {
    let sink = MemoryResultSink::rejecting();
    let session = Session::new(vec![]);
    let err = sink
        .record(&result_for(&session, "h", "a", Outcome::Fail))
        .await
        .unwrap_err();

    assert!(matches!(err, SinkError::Rejected(_)));
    assert!(sink.results().is_empty());
}

// ===========================================================================
// JsonlResultSink
// ===========================================================================

#[tokio::test]
async fn jsonl_sink_appends_whole_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results").join("session.jsonl");
    let sink = JsonlResultSink::open(&path).await.unwrap();
    let session = Session::new(vec!["ltp".to_string()]);

    sink.open_session(&session).await.unwrap();
    let r = result_for(&session, "hardy.lab", "hardy", Outcome::Fail);
    sink.record(&r).await.unwrap();

    let lines = JsonlResultSink::read_all(&path).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], JournalLine::SessionOpened(session));
    assert_eq!(lines[1], JournalLine::Result(r));
}

#[tokio::test]
async fn jsonl_sink_concurrent_writes_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concurrent.jsonl");
    let sink = Arc::new(JsonlResultSink::open(&path).await.unwrap());
    let session = Session::new(vec!["ltp".to_string()]);

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let sink = Arc::clone(&sink);
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let host = format!("host-{worker}");
                let alias = format!("alias-{i}");
                sink.record(&result_for(&session, &host, &alias, Outcome::Pass))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every line must parse on its own; a torn write would fail here.
    let lines = JsonlResultSink::read_all(&path).await.unwrap();
    assert_eq!(lines.len(), 200);
    assert!(lines
        .iter()
        .all(|l| matches!(l, JournalLine::Result(r) if r.session_id == session.id)));
}

#[tokio::test]
async fn jsonl_sink_reopen_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.jsonl");
    let session = Session::new(vec![]);

    {
        let sink = JsonlResultSink::open(&path).await.unwrap();
        sink.open_session(&session).await.unwrap();
    }
    let sink = JsonlResultSink::open(&path).await.unwrap();
    sink.close_session(&SessionSummary::open(&session).close())
        .await
        .unwrap();

    let lines = JsonlResultSink::read_all(&path).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert!(matches!(lines[1], JournalLine::SessionClosed(ref s) if s.is_closed()));
}
