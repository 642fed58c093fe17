//! Integration tests for orchestrated dispatch.
//!
//! Most tests drive the orchestrator through the scripted connector; the
//! last ones go through a real agent over TCP and the in-process connector.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use testbed_core::{Inventory, RetryPolicy, RunConfig};
use testbed_dispatch::fakes::{HostScript, ScriptedConnector};
use testbed_dispatch::{Agent, Driver, LocalConnector, Orchestrator, TcpConnector};
use testbed_state::fakes::MemoryResultSink;
use testbed_state::{
    FailureKind, HostId, JournalLine, JsonlResultSink, Outcome, ResultSink, Session,
};

const LAB: &str = r#"
testbeds:
  - {host: dapper.lab, role: kernel_test, aliases: [dapper]}
  - {host: hardy.lab, role: kernel_test, aliases: [hardy]}
  - {host: fs1.lab, role: file_server, aliases: [server]}
jobs:
  dbench:
    targets:
      dapper: Ubuntu 6.06 dbench
      hardy: Ubuntu 8.04 dbench
      server: file server dbench
    command: [dbench, "-t", "{STRESS_SECS}", "64"]
  broken:
    targets:
      dapper: fine
      intrepid: not a testbed
    command: ["true"]
  ltp:
    targets:
      hardy: LTP on hardy
    bundle: ltp
    command: [sh, "-c", "tar xzf {LTP}"]
  reboot:
    targets:
      dapper: after reboot
      server: after reboot
    command: ["true"]
    settle: true
testsuite:
  ltp:
    LTP: Linux Test Project
constants:
  reboot_settle_secs: 300
  artifacts:
    LTP: /nonexistent/artifacts/ltp.tgz
"#;

fn lab() -> (Arc<Inventory>, RunConfig) {
    let inventory = Inventory::from_yaml_str(LAB).unwrap();
    let mut config = inventory.run_config().clone();
    config.retry = RetryPolicy::immediate(3);
    (Arc::new(inventory), config)
}

fn scripted_orchestrator(
    connector: &ScriptedConnector,
    sink: &Arc<MemoryResultSink>,
) -> (Orchestrator, Arc<Inventory>) {
    let (inventory, config) = lab();
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        config,
        Arc::new(connector.clone()),
        sink.clone(),
    );
    (orchestrator, inventory)
}

// ===========================================================================
// Cardinality and ordering
// ===========================================================================

#[tokio::test]
async fn every_assignment_yields_exactly_one_result() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, inventory) = scripted_orchestrator(&connector, &sink);

    let run = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap();
    assert_eq!(run.expected(), 3);
    let results = run.collect().await;

    let resolved = inventory.resolve_job("dbench").unwrap();
    assert_eq!(results.len(), resolved.len());
    let targets: HashSet<(HostId, String)> = results
        .iter()
        .map(|r| (r.host.clone(), r.alias.clone()))
        .collect();
    assert_eq!(targets.len(), 3);
    assert!(results.iter().all(|r| r.outcome == Outcome::Pass));
    assert_eq!(sink.results().len(), 3);
}

#[tokio::test]
async fn one_in_flight_per_host_parallel_across_hosts() {
    let doc = r#"
testbeds:
  - {host: a.lab, role: left, aliases: [a1, a2, a3]}
  - {host: b.lab, role: right, aliases: [b1, b2, b3]}
jobs:
  par:
    targets: {a1: one, b1: one, a2: two, b2: two, a3: three, b3: three}
    command: ["true"]
"#;
    let inventory = Arc::new(Inventory::from_yaml_str(doc).unwrap());
    let connector = ScriptedConnector::new()
        .with_host("a.lab", HostScript::delayed(Duration::from_millis(100)))
        .with_host("b.lab", HostScript::delayed(Duration::from_millis(100)));
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(connector.clone()),
        Arc::new(MemoryResultSink::new()),
    );

    let results = orchestrator
        .run_job("par", Session::new(vec!["par".into()]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 6);
    assert_eq!(connector.max_in_flight("a.lab"), 1);
    assert_eq!(connector.max_in_flight("b.lab"), 1);
    assert!(connector.max_global_in_flight() >= 2);

    // Host-local order follows resolution order.
    let a_aliases: Vec<&str> = results
        .iter()
        .filter(|r| r.host.as_str() == "a.lab")
        .map(|r| r.alias.as_str())
        .collect();
    assert_eq!(a_aliases, vec!["a1", "a2", "a3"]);
}

// ===========================================================================
// Configuration errors
// ===========================================================================

#[tokio::test]
async fn unresolved_alias_dispatches_nothing() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let err = match orchestrator.run_job("broken", Session::new(vec!["broken".into()])) {
        Ok(_) => panic!("broken job must not start"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("intrepid"));
    assert_eq!(connector.connects("dapper.lab"), 0);
    assert!(sink.sessions().is_empty());
    assert!(sink.results().is_empty());
}

#[tokio::test]
async fn batch_with_one_bad_job_dispatches_nothing() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let result = orchestrator.run_jobs(&["dbench", "srcfs"], Session::new(vec![]));
    assert!(result.is_err());
    assert!(connector.executed().is_empty());
}

// ===========================================================================
// Retry
// ===========================================================================

#[tokio::test]
async fn connection_retried_until_success_within_bound() {
    let connector = ScriptedConnector::new().with_host("hardy.lab", HostScript::flaky(2));
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let results = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .collect()
        .await;

    let hardy = results
        .iter()
        .find(|r| r.host.as_str() == "hardy.lab")
        .unwrap();
    assert_eq!(hardy.outcome, Outcome::Pass);
    assert_eq!(hardy.attempts, 3);
    assert_eq!(connector.connects("hardy.lab"), 3);
}

#[tokio::test]
async fn connection_failure_past_bound_is_error() {
    let connector = ScriptedConnector::new().with_host("hardy.lab", HostScript::flaky(10));
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let results = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .collect()
        .await;

    let hardy = results
        .iter()
        .find(|r| r.host.as_str() == "hardy.lab")
        .unwrap();
    assert_eq!(hardy.outcome, Outcome::Error);
    assert_eq!(
        hardy.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Connection)
    );
    assert_eq!(hardy.attempts, 3);
    assert_eq!(connector.connects("hardy.lab"), 3);
    // Other hosts are unaffected.
    assert_eq!(results.iter().filter(|r| r.passed()).count(), 2);
}

// ===========================================================================
// Timeouts, outcomes, the dbench scenario
// ===========================================================================

#[tokio::test]
async fn dbench_scenario_one_host_times_out() {
    let connector = ScriptedConnector::new().with_host("hardy.lab", HostScript::timing_out());
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let (results, summary) = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .finish()
        .await;

    assert_eq!(results.len(), 3);
    let timeouts: Vec<_> = results
        .iter()
        .filter(|r| r.outcome == Outcome::Timeout)
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].host.as_str(), "hardy.lab");
    assert_eq!(timeouts[0].stdout, vec!["partial"]);
    assert_eq!(results.iter().filter(|r| r.passed()).count(), 2);

    let summary = summary.unwrap();
    assert!(summary.is_closed());
    assert_eq!((summary.total, summary.passed, summary.timeouts), (3, 2, 1));
    assert_eq!(sink.summaries(), vec![summary]);
}

#[tokio::test]
async fn unresponsive_agent_times_out_on_orchestrator_side() {
    let (inventory, mut config) = lab();
    config.default_timeout = Duration::from_millis(200);
    config.dispatch_grace = Duration::from_millis(100);
    let connector =
        ScriptedConnector::new().with_host("hardy.lab", HostScript::delayed(Duration::from_secs(30)));
    let orchestrator = Orchestrator::new(
        inventory,
        config,
        Arc::new(connector.clone()),
        Arc::new(MemoryResultSink::new()),
    );

    let started = std::time::Instant::now();
    let results = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .collect()
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let hardy = results
        .iter()
        .find(|r| r.host.as_str() == "hardy.lab")
        .unwrap();
    assert_eq!(hardy.outcome, Outcome::Timeout);
    assert_eq!(hardy.exit_status, None);
}

#[tokio::test]
async fn nonzero_exit_is_fail_and_reader_failure_is_error() {
    let connector = ScriptedConnector::new()
        .with_host("dapper.lab", HostScript::exit(2))
        .with_host(
            "fs1.lab",
            HostScript {
                reader_failure: Some("stderr: Input/output error".into()),
                ..HostScript::default()
            },
        )
        .with_host(
            "hardy.lab",
            HostScript {
                degraded: true,
                ..HostScript::default()
            },
        );
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let results = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .collect()
        .await;

    let by_host = |host: &str| results.iter().find(|r| r.host.as_str() == host).unwrap();
    assert_eq!(by_host("dapper.lab").outcome, Outcome::Fail);
    assert_eq!(by_host("dapper.lab").exit_status, Some(2));

    let server = by_host("fs1.lab");
    assert_eq!(server.outcome, Outcome::Error);
    assert!(server.degraded);
    assert_eq!(server.exit_status, Some(0));
    let failure = server.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Reader);
    assert!(failure.message.contains("Input/output error"));

    // Output lost without a read error keeps the exit-status verdict.
    let hardy = by_host("hardy.lab");
    assert_eq!(hardy.outcome, Outcome::Pass);
    assert!(hardy.degraded);
    assert!(hardy.failure.is_none());
}

// ===========================================================================
// Staging
// ===========================================================================

#[tokio::test]
async fn unreadable_artifact_never_executes() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let results = orchestrator
        .run_job("ltp", Session::new(vec!["ltp".into()]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Error);
    assert_eq!(
        results[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Staging)
    );
    assert_eq!(connector.connects("hardy.lab"), 0);
    assert!(connector.executed().is_empty());
}

#[tokio::test]
async fn agent_staging_error_never_executes() {
    let connector = ScriptedConnector::new().with_host(
        "hardy.lab",
        HostScript {
            stage_error: Some("no space left on device".into()),
            ..HostScript::default()
        },
    );
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let results = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap()
        .collect()
        .await;

    let hardy = results
        .iter()
        .find(|r| r.host.as_str() == "hardy.lab")
        .unwrap();
    assert_eq!(
        hardy.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Staging)
    );
    assert!(!connector.executed().contains(&HostId::from("hardy.lab")));
    // Whatever staging left behind is removed.
    assert_eq!(connector.cleanups("hardy.lab"), 1);
}

// ===========================================================================
// Abort and settle
// ===========================================================================

#[tokio::test]
async fn abort_reports_every_assignment_as_aborted() {
    let doc = r#"
testbeds:
  - {host: slow.lab, role: r, aliases: [one, two, three]}
jobs:
  soak:
    targets: {one: a, two: b, three: c}
    command: ["true"]
"#;
    let inventory = Arc::new(Inventory::from_yaml_str(doc).unwrap());
    let connector =
        ScriptedConnector::new().with_host("slow.lab", HostScript::delayed(Duration::from_secs(30)));
    let sink = Arc::new(MemoryResultSink::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(connector.clone()),
        sink.clone(),
    );

    let mut run = orchestrator
        .run_job("soak", Session::new(vec!["soak".into()]))
        .unwrap();
    let abort = run.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort.abort();
    });

    let started = std::time::Instant::now();
    let mut results = Vec::new();
    while let Some(result) = run.next().await {
        results.push(result);
    }

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.outcome == Outcome::Aborted));
    // Only the first one ever reached the agent.
    assert_eq!(results[0].attempts, 1);
    assert_eq!(results[1].attempts, 0);
    assert!(connector.executed().is_empty());
    assert_eq!(sink.summaries()[0].aborted, 3);
}

#[tokio::test(start_paused = true)]
async fn settle_waits_once_per_host_in_parallel() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let started = tokio::time::Instant::now();
    let results = orchestrator
        .run_job("reboot", Session::new(vec!["reboot".into()]))
        .unwrap()
        .collect()
        .await;

    let waited = started.elapsed();
    assert_eq!(results.len(), 2);
    assert!(waited >= Duration::from_secs(300));
    assert!(waited < Duration::from_secs(600));
}

// ===========================================================================
// Stream interface and sinks
// ===========================================================================

#[tokio::test]
async fn job_run_is_a_stream_that_ends_after_session_close() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let run = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap();
    let session_id = run.session_id();
    let results: Vec<_> = StreamExt::collect(run).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.session_id == session_id));
    // The stream only ends once the summary is written.
    assert_eq!(sink.summaries().len(), 1);
    assert!(sink.summaries()[0].is_closed());
}

#[tokio::test]
async fn jsonl_sink_receives_whole_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink: Arc<dyn ResultSink> = Arc::new(JsonlResultSink::open(&path).await.unwrap());
    let (inventory, config) = lab();
    let orchestrator = Orchestrator::new(
        inventory,
        config,
        Arc::new(ScriptedConnector::new().with_host("hardy.lab", HostScript::timing_out())),
        sink,
    );

    let run = orchestrator
        .run_job("dbench", Session::new(vec!["dbench".into()]))
        .unwrap();
    let session_id = run.session_id();
    run.collect().await;

    let lines = JsonlResultSink::read_all(&path).await.unwrap();
    let ours: Vec<&JournalLine> = lines
        .iter()
        .filter(|l| match l {
            JournalLine::SessionOpened(s) => s.id == session_id,
            JournalLine::Result(r) => r.session_id == session_id,
            JournalLine::SessionClosed(s) => s.id == session_id,
        })
        .collect();
    assert_eq!(ours.len(), 5);
    assert!(matches!(ours[0], JournalLine::SessionOpened(_)));
    assert!(matches!(ours[4], JournalLine::SessionClosed(s) if s.timeouts == 1));
}

// ===========================================================================
// Real agents
// ===========================================================================

fn agent_lab(host: &str, root: &std::path::Path, script: &std::path::Path) -> String {
    format!(
        r#"
testbeds:
  - {{host: "{host}", role: bench, aliases: [bench]}}
jobs:
  unixbench:
    targets:
      bench: scripted benchmark
    bundle: bench
    command: [sh, "{{BENCH}}"]
  failing:
    targets:
      bench: exits non-zero
    command: [sh, "-c", "echo broken >&2; exit 1"]
  linger:
    targets:
      bench: leaves a background child holding the pipes
    command: [sh, "-c", "sleep 60 & echo done"]
  flood:
    targets:
      bench: more output than one frame holds
    command: [sh, "-c", "head -c 20000000 /dev/zero | tr '\\0' x | fold -w 100; echo; echo flood done"]
testsuite:
  bench:
    BENCH: benchmark script
constants:
  root: "{root}"
  artifacts:
    BENCH: "{script}"
"#,
        root = root.display(),
        script = script.display(),
    )
}

fn write_script(dir: &std::path::Path) -> std::path::PathBuf {
    let script = dir.join("bench.sh");
    std::fs::write(&script, "echo score 42\necho 42 > score.txt\n").unwrap();
    script
}

#[tokio::test]
async fn tcp_agent_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let agent = Arc::new(Agent::new(root.path()).with_hostname("bench"));
    tokio::spawn(agent.serve(listener));

    let inventory =
        Arc::new(Inventory::from_yaml_str(&agent_lab("127.0.0.1", root.path(), &script)).unwrap());
    let sink = Arc::new(MemoryResultSink::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(TcpConnector::new(port)),
        sink.clone(),
    );

    let (results, summary) = orchestrator
        .run_jobs(
            &["unixbench", "failing"],
            Session::new(vec!["unixbench".into(), "failing".into()]),
        )
        .unwrap()
        .finish()
        .await;

    assert_eq!(results.len(), 2);
    let bench = &results[0];
    assert_eq!(bench.alias, "bench");
    assert_eq!(bench.job, "unixbench");
    assert_eq!(bench.outcome, Outcome::Pass);
    assert_eq!(bench.stdout, vec!["score 42"]);
    assert_eq!(bench.artifacts.len(), 1);
    assert_eq!(bench.artifacts[0].name, "score.txt");

    let failing = &results[1];
    assert_eq!(failing.outcome, Outcome::Fail);
    assert_eq!(failing.stderr, vec!["broken"]);

    assert_eq!(summary.map(|s| (s.passed, s.failed)), Some((1, 1)));
    // Staging directories are cleaned up after each assignment.
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn local_connector_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path());

    let inventory =
        Arc::new(Inventory::from_yaml_str(&agent_lab("localhost", root.path(), &script)).unwrap());
    let agent = Arc::new(Agent::new(root.path()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(LocalConnector::new(agent)),
        Arc::new(MemoryResultSink::new()),
    );

    let results = orchestrator
        .run_job("unixbench", Session::new(vec!["unixbench".into()]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Pass);
    assert_eq!(results[0].attempts, 1);
}

#[tokio::test]
async fn output_past_frame_limit_is_trimmed_not_lost() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path());

    let inventory =
        Arc::new(Inventory::from_yaml_str(&agent_lab("localhost", root.path(), &script)).unwrap());
    let agent = Arc::new(Agent::new(root.path()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(LocalConnector::new(agent)),
        Arc::new(MemoryResultSink::new()),
    );

    let results = orchestrator
        .run_job("flood", Session::new(vec!["flood".into()]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let flood = &results[0];
    assert_eq!(flood.outcome, Outcome::Pass, "{:?}", flood.failure);
    assert_eq!(flood.exit_status, Some(0));
    assert!(flood.degraded);
    assert!(flood.dropped_lines > 0);
    assert_eq!(flood.stdout.last().map(String::as_str), Some("flood done"));
    assert!(
        flood.stdout.len() as u64 + flood.dropped_lines >= 200_001,
        "every line is either kept or counted as dropped"
    );
}

#[tokio::test]
async fn background_child_after_exit_passes_degraded() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path());

    let inventory =
        Arc::new(Inventory::from_yaml_str(&agent_lab("localhost", root.path(), &script)).unwrap());
    let driver = Driver::new().with_reader_grace(Duration::from_millis(300));
    let agent = Arc::new(Agent::new(root.path()).with_driver(driver));
    let orchestrator = Orchestrator::new(
        Arc::clone(&inventory),
        inventory.run_config().clone(),
        Arc::new(LocalConnector::new(agent)),
        Arc::new(MemoryResultSink::new()),
    );

    let results = orchestrator
        .run_job("linger", Session::new(vec!["linger".into()]))
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let linger = &results[0];
    assert_eq!(linger.outcome, Outcome::Pass);
    assert_eq!(linger.exit_status, Some(0));
    assert_eq!(linger.stdout, vec!["done"]);
    assert!(linger.degraded);
    assert!(linger.failure.is_none());
}

#[tokio::test]
async fn repeated_job_name_is_planned_once() {
    let connector = ScriptedConnector::new();
    let sink = Arc::new(MemoryResultSink::new());
    let (orchestrator, _) = scripted_orchestrator(&connector, &sink);

    let run = orchestrator
        .run_jobs(
            &["dbench", "dbench"],
            Session::new(vec!["dbench".into(), "dbench".into()]),
        )
        .unwrap();
    assert_eq!(run.expected(), 3);
    let results = run.collect().await;

    assert_eq!(results.len(), 3);
    let targets: HashSet<(String, String)> = results
        .iter()
        .map(|r| (r.host.to_string(), r.alias.clone()))
        .collect();
    assert_eq!(targets.len(), 3);
    assert_eq!(connector.executed().len(), 3);
}
