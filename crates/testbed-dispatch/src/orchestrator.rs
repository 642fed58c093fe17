//! Orchestrator: sequences assignments per host and runs hosts in parallel.
//!
//! Every job of a request is resolved before anything is dispatched, so a
//! configuration error yields zero results. Assignments are then grouped by
//! host in resolution order and handed to one worker task per host. A worker
//! dispatches strictly one assignment at a time; workers run concurrently.
//!
//! Results flow worker → sink, then worker → supervisor → [`JobRun`]. The
//! supervisor closes the session once every worker is done, and only then
//! ends the stream.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use testbed_core::{plan_job, Assignment, ConfigResult, Inventory, RunConfig};
use testbed_state::{ExecutionResult, HostId, ResultSink, Session, SessionId, SessionSummary};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::abort::{abort_pair, AbortHandle, AbortSignal};
use crate::connector::AgentConnector;
use crate::obs::{
    emit_assignment_dispatched, emit_assignment_finished, emit_session_closed,
    emit_session_opened, emit_sink_error,
};
use crate::remote::RemoteExecutor;

/// Dispatches jobs from one inventory.
pub struct Orchestrator {
    inventory: Arc<Inventory>,
    config: Arc<RunConfig>,
    executor: Arc<RemoteExecutor>,
    sink: Arc<dyn ResultSink>,
}

impl Orchestrator {
    pub fn new(
        inventory: Arc<Inventory>,
        config: RunConfig,
        connector: Arc<dyn AgentConnector>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let config = Arc::new(config);
        let executor = Arc::new(RemoteExecutor::new(connector, Arc::clone(&config)));
        Self {
            inventory,
            config,
            executor,
            sink,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolve `job` and start dispatching it. Must be called from within
    /// a Tokio runtime.
    pub fn run_job(&self, job: &str, session: Session) -> ConfigResult<JobRun> {
        self.run_jobs(&[job], session)
    }

    /// Resolve every job, then dispatch them all in one session. A job named
    /// more than once is planned once.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn run_jobs(&self, jobs: &[&str], session: Session) -> ConfigResult<JobRun> {
        let mut seen = HashSet::new();
        let mut assignments = Vec::new();
        for job in jobs.iter().filter(|job| seen.insert(**job)) {
            assignments.extend(plan_job(&self.inventory, &self.config, job)?);
        }
        let by_host = group_by_host(assignments);
        let expected = by_host.iter().map(|(_, a)| a.len()).sum();
        info!(hosts = by_host.len(), assignments = expected, "dispatch planned");

        let (abort, signal) = abort_pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = session.id;
        let supervisor = tokio::spawn(supervise(
            session,
            by_host,
            expected,
            Arc::clone(&self.executor),
            Arc::clone(&self.sink),
            signal,
            tx,
        ));

        Ok(JobRun {
            session_id,
            expected,
            results: rx,
            abort,
            supervisor,
        })
    }
}

/// Assignments per host, hosts in first-seen order, assignments in
/// resolution order within each host.
fn group_by_host(assignments: Vec<Assignment>) -> Vec<(HostId, Vec<Assignment>)> {
    let mut groups: Vec<(HostId, Vec<Assignment>)> = Vec::new();
    for assignment in assignments {
        match groups.iter_mut().find(|(host, _)| *host == assignment.host) {
            Some((_, queue)) => queue.push(assignment),
            None => groups.push((assignment.host.clone(), vec![assignment])),
        }
    }
    groups
}

async fn supervise(
    session: Session,
    by_host: Vec<(HostId, Vec<Assignment>)>,
    expected: usize,
    executor: Arc<RemoteExecutor>,
    sink: Arc<dyn ResultSink>,
    signal: AbortSignal,
    out: UnboundedSender<ExecutionResult>,
) -> SessionSummary {
    let session_key = session.id.to_string();
    emit_session_opened(&session_key, &session.label, &session.jobs, expected);
    if let Err(e) = sink.open_session(&session).await {
        emit_sink_error(&session_key, &e);
    }

    let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
    let workers: Vec<JoinHandle<()>> = by_host
        .into_iter()
        .map(|(host, queue)| {
            tokio::spawn(host_worker(
                host,
                queue,
                session.id,
                Arc::clone(&executor),
                Arc::clone(&sink),
                signal.clone(),
                worker_tx.clone(),
            ))
        })
        .collect();
    drop(worker_tx);

    let mut summary = SessionSummary::open(&session);
    while let Some(result) = worker_rx.recv().await {
        summary.observe(&result);
        // The caller may have dropped the run; results are still recorded.
        let _ = out.send(result);
    }
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "host worker panicked");
        }
    }

    let summary = summary.close();
    if let Err(e) = sink.close_session(&summary).await {
        emit_sink_error(&session_key, &e);
    }
    emit_session_closed(&summary);
    summary
}

#[instrument(skip_all, fields(host = %host))]
async fn host_worker(
    host: HostId,
    queue: Vec<Assignment>,
    session_id: SessionId,
    executor: Arc<RemoteExecutor>,
    sink: Arc<dyn ResultSink>,
    mut abort: AbortSignal,
    results: UnboundedSender<ExecutionResult>,
) {
    let session_key = session_id.to_string();
    let mut settled: HashSet<String> = HashSet::new();

    for assignment in queue {
        if let Some(settle) = assignment.settle {
            if settled.insert(assignment.job.clone()) && !abort.is_aborted() {
                info!(job = %assignment.job, settle_secs = settle.as_secs(), "waiting for host to settle");
                tokio::select! {
                    _ = tokio::time::sleep(settle) => {}
                    _ = abort.aborted() => {}
                }
            }
        }

        let result = if abort.is_aborted() {
            executor.not_started(session_id, &assignment)
        } else {
            emit_assignment_dispatched(
                &session_key,
                host.as_str(),
                &assignment.job,
                &assignment.alias,
            );
            executor
                .dispatch_abortable(session_id, &assignment, abort.clone())
                .await
        };
        emit_assignment_finished(
            &session_key,
            host.as_str(),
            &result.job,
            &result.alias,
            result.outcome,
            result.duration_ms,
        );

        if let Err(e) = sink.record(&result).await {
            emit_sink_error(&session_key, &e);
        }
        if results.send(result).is_err() {
            warn!("supervisor gone; dropping result");
        }
    }
}

/// A running dispatch: the lazy sequence of results plus its controls.
///
/// Results arrive in completion order. Per host they follow resolution
/// order; across hosts there is no ordering.
pub struct JobRun {
    session_id: SessionId,
    expected: usize,
    results: UnboundedReceiver<ExecutionResult>,
    abort: AbortHandle,
    supervisor: JoinHandle<SessionSummary>,
}

impl JobRun {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Number of results this run will produce.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Cancel outstanding dispatches. Queued assignments are reported as
    /// aborted without starting.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Next result, or `None` once the session is closed.
    pub async fn next(&mut self) -> Option<ExecutionResult> {
        self.results.recv().await
    }

    /// Drain every result.
    pub async fn collect(mut self) -> Vec<ExecutionResult> {
        let mut all = Vec::with_capacity(self.expected);
        while let Some(result) = self.results.recv().await {
            all.push(result);
        }
        all
    }

    /// Drain every result and return them with the closed session summary.
    pub async fn finish(mut self) -> (Vec<ExecutionResult>, Option<SessionSummary>) {
        let mut all = Vec::with_capacity(self.expected);
        while let Some(result) = self.results.recv().await {
            all.push(result);
        }
        let summary = match self.supervisor.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "session supervisor failed");
                None
            }
        };
        (all, summary)
    }
}

impl Stream for JobRun {
    type Item = ExecutionResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_recv(cx)
    }
}
