//! Scripted agent connector for tests.
//!
//! Each host follows a [`HostScript`]: how many connection attempts fail
//! before one succeeds, how long `Execute` takes, and what it reports. The
//! connector counts connections and tracks how many executions are in
//! flight per host and overall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use testbed_state::{FailureKind, HostId};

use crate::connector::{AgentConnector, AgentSession};
use crate::error::{DispatchError, DispatchResult, ProtocolResult};
use crate::protocol::{ErrorResponse, ExecuteResponse, Request, Response};

/// Behaviour of one scripted host.
#[derive(Debug, Clone)]
pub struct HostScript {
    /// Connection attempts that fail before the first success
    pub connect_failures: u32,
    pub stage_error: Option<String>,
    pub exec_delay: Duration,
    pub exit_status: Option<i32>,
    pub timed_out: bool,
    /// Output lost without a read error, e.g. a stream left open
    pub degraded: bool,
    /// A stream that failed to read
    pub reader_failure: Option<String>,
    pub stdout: Vec<String>,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            connect_failures: 0,
            stage_error: None,
            exec_delay: Duration::ZERO,
            exit_status: Some(0),
            timed_out: false,
            degraded: false,
            reader_failure: None,
            stdout: Vec::new(),
        }
    }
}

impl HostScript {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_status: Some(code),
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            exec_delay: delay,
            ..Self::default()
        }
    }

    /// The agent reports that the command overran its timeout.
    pub fn timing_out() -> Self {
        Self {
            exit_status: None,
            timed_out: true,
            stdout: vec!["partial".to_string()],
            ..Self::default()
        }
    }

    pub fn flaky(connect_failures: u32) -> Self {
        Self {
            connect_failures,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Tracker {
    scripts: HashMap<HostId, HostScript>,
    connects: HashMap<HostId, u32>,
    in_flight: HashMap<HostId, usize>,
    max_in_flight: HashMap<HostId, usize>,
    executed: Vec<HostId>,
    cleanups: HashMap<HostId, u32>,
}

#[derive(Debug, Default)]
struct Shared {
    tracker: Mutex<Tracker>,
    global_in_flight: AtomicUsize,
    global_max: AtomicUsize,
}

/// In-memory [`AgentConnector`] following per-host scripts.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, script: HostScript) -> Self {
        self.lock().scripts.insert(HostId::from(host), script);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.shared.tracker.lock().unwrap()
    }

    /// Connection attempts made to `host`, failed ones included.
    pub fn connects(&self, host: &str) -> u32 {
        self.lock()
            .connects
            .get(&HostId::from(host))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous executions seen on `host`.
    pub fn max_in_flight(&self, host: &str) -> usize {
        self.lock()
            .max_in_flight
            .get(&HostId::from(host))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous executions seen across all hosts.
    pub fn max_global_in_flight(&self) -> usize {
        self.shared.global_max.load(Ordering::SeqCst)
    }

    /// `Cleanup` requests received by `host`.
    pub fn cleanups(&self, host: &str) -> u32 {
        self.lock()
            .cleanups
            .get(&HostId::from(host))
            .copied()
            .unwrap_or(0)
    }

    /// Hosts in the order their executions completed.
    pub fn executed(&self) -> Vec<HostId> {
        self.lock().executed.clone()
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(&self, host: &HostId) -> DispatchResult<Box<dyn AgentSession>> {
        let mut tracker = self.lock();
        let script = tracker.scripts.get(host).cloned().unwrap_or_default();
        let attempt = {
            let count = tracker.connects.entry(host.clone()).or_insert(0);
            *count += 1;
            *count
        };
        drop(tracker);

        if attempt <= script.connect_failures {
            return Err(DispatchError::Connection {
                host: host.to_string(),
                reason: format!("scripted failure {attempt}"),
            });
        }
        Ok(Box::new(ScriptedSession {
            host: host.clone(),
            script,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedSession {
    host: HostId,
    script: HostScript,
    shared: Arc<Shared>,
}

/// Decrements the in-flight counters even if the call is cancelled.
struct InFlight {
    host: HostId,
    shared: Arc<Shared>,
}

impl InFlight {
    fn enter(host: &HostId, shared: &Arc<Shared>) -> Self {
        let now = shared.global_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.global_max.fetch_max(now, Ordering::SeqCst);
        let mut tracker = shared.tracker.lock().unwrap();
        let count = tracker.in_flight.entry(host.clone()).or_insert(0);
        *count += 1;
        let current = *count;
        let max = tracker.max_in_flight.entry(host.clone()).or_insert(0);
        *max = (*max).max(current);
        drop(tracker);
        Self {
            host: host.clone(),
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.global_in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut tracker = self.shared.tracker.lock().unwrap();
        if let Some(count) = tracker.in_flight.get_mut(&self.host) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn call(&mut self, request: &Request) -> ProtocolResult<Response> {
        let response = match request {
            Request::Ping => Response::Pong {
                version: "scripted".to_string(),
                hostname: self.host.to_string(),
            },
            Request::Stage(req) => match &self.script.stage_error {
                Some(message) => {
                    Response::Error(ErrorResponse::new(FailureKind::Staging, message.clone()))
                }
                None => Response::Staged {
                    assignment_id: req.assignment_id,
                    manifest: Vec::new(),
                },
            },
            Request::Execute(req) => {
                let guard = InFlight::enter(&self.host, &self.shared);
                tokio::time::sleep(self.script.exec_delay).await;
                drop(guard);
                self.shared
                    .tracker
                    .lock()
                    .unwrap()
                    .executed
                    .push(self.host.clone());
                Response::Executed(ExecuteResponse {
                    assignment_id: req.assignment_id,
                    exit_status: self.script.exit_status,
                    stdout: self.script.stdout.clone(),
                    stderr: Vec::new(),
                    duration_ms: self.script.exec_delay.as_millis() as u64,
                    degraded: self.script.degraded || self.script.reader_failure.is_some(),
                    timed_out: self.script.timed_out,
                    artifacts: Vec::new(),
                    dropped_lines: 0,
                    reader_failures: self.script.reader_failure.iter().cloned().collect(),
                })
            }
            Request::Cleanup(req) => {
                *self
                    .shared
                    .tracker
                    .lock()
                    .unwrap()
                    .cleanups
                    .entry(self.host.clone())
                    .or_insert(0) += 1;
                Response::CleanedUp {
                    assignment_id: req.assignment_id,
                }
            }
        };
        Ok(response)
    }
}
