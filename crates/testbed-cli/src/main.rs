//! Testbed - dispatch test jobs to lab machines
//!
//! The `testbed` command drives the orchestrator from an inventory file.
//!
//! ## Commands
//!
//! - `show`: Print testbeds, jobs, bundles and constants
//! - `ping`: Check that the agent on each host answers
//! - `run`: Dispatch jobs and record their results
//! - `clean`: Empty the staging root on hosts
//! - `local`: Run one command through the subprocess driver, echoing output live

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use testbed_core::{init_tracing, Constants, Inventory, LogFormat, RunConfig};
use testbed_dispatch::protocol::{CleanupRequest, Request, Response};
use testbed_dispatch::{
    Agent, AgentConnector, CommandSpec, Driver, DriverError, LocalConnector, Orchestrator,
    StreamKind, TaggedLine, TcpConnector,
};
use testbed_state::{ExecutionResult, HostId, JsonlResultSink, Session, SessionSummary};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "testbed")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dispatch test jobs to lab machines and record the results", long_about = None)]
struct Cli {
    /// Inventory file
    #[arg(short, long, global = true, env = "TESTBED_CONFIG", default_value = "testbed.yaml")]
    config: PathBuf,

    /// Agent port (overrides the inventory)
    #[arg(long, global = true, env = "TESTBED_AGENT_PORT")]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the inventory
    Show,

    /// Check that agents answer
    Ping {
        /// Hosts or aliases (default: every testbed)
        hosts: Vec<String>,

        /// Use an in-process agent instead of TCP
        #[arg(long)]
        local: bool,
    },

    /// Dispatch jobs and record their results
    Run {
        /// Jobs to run
        jobs: Vec<String>,

        /// Run every job in the inventory
        #[arg(long, conflicts_with = "jobs")]
        all: bool,

        /// Session label
        #[arg(short, long)]
        label: Option<String>,

        /// JSON-lines results file
        #[arg(short, long, env = "TESTBED_RESULTS", default_value = "testbed-results.jsonl")]
        results: PathBuf,

        /// Use an in-process agent instead of TCP
        #[arg(long)]
        local: bool,
    },

    /// Empty the staging root on hosts
    Clean {
        /// Hosts or aliases (default: every testbed)
        hosts: Vec<String>,

        /// Use an in-process agent instead of TCP
        #[arg(long)]
        local: bool,
    },

    /// Run one command locally, echoing OUTPUT>/ERROR> lines as they arrive
    Local {
        /// Timeout in seconds
        #[arg(short, long, default_value = "3600")]
        timeout: u64,

        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    match cli.command {
        Commands::Show => cmd_show(&load_inventory(&cli.config)?),
        Commands::Ping { hosts, local } => {
            let inventory = load_inventory(&cli.config)?;
            let config = run_config(&inventory, cli.port);
            cmd_ping(&inventory, connector(&config, local), &hosts).await
        }
        Commands::Run {
            jobs,
            all,
            label,
            results,
            local,
        } => {
            let inventory = Arc::new(load_inventory(&cli.config)?);
            let config = run_config(&inventory, cli.port);
            let jobs = if all {
                inventory.jobs().iter().map(|j| j.name.clone()).collect()
            } else {
                jobs
            };
            let connector = connector(&config, local);
            let summary = cmd_run(inventory, config, connector, jobs, label, &results).await?;
            if !summary.success() {
                bail!(
                    "{} of {} assignment(s) did not pass",
                    summary.total - summary.passed,
                    summary.total
                );
            }
            Ok(())
        }
        Commands::Clean { hosts, local } => {
            let inventory = load_inventory(&cli.config)?;
            let config = run_config(&inventory, cli.port);
            cmd_clean(&inventory, connector(&config, local), &hosts).await
        }
        Commands::Local { timeout, command } => {
            let code = cmd_local(&command, Duration::from_secs(timeout)).await?;
            if code != Some(0) {
                bail!("command did not exit cleanly");
            }
            Ok(())
        }
    }
}

fn load_inventory(path: &Path) -> Result<Inventory> {
    Inventory::load(path).with_context(|| format!("Failed to load inventory {}", path.display()))
}

fn run_config(inventory: &Inventory, port: Option<u16>) -> RunConfig {
    let mut config = inventory.run_config().clone();
    if let Some(port) = port {
        config.agent_port = port;
    }
    config
}

fn connector(config: &RunConfig, local: bool) -> Arc<dyn AgentConnector> {
    if local {
        let agent = Agent::new(&config.constants.root).with_hostname("localhost");
        Arc::new(LocalConnector::new(Arc::new(agent)))
    } else {
        Arc::new(TcpConnector::new(config.agent_port))
    }
}

/// Hosts named directly or through an alias; every testbed if none given.
fn select_hosts(inventory: &Inventory, names: &[String]) -> Result<Vec<HostId>> {
    if names.is_empty() {
        return Ok(inventory.testbeds().iter().map(|t| t.host.clone()).collect());
    }
    let mut hosts = Vec::new();
    for name in names {
        let matched: Vec<HostId> = inventory
            .testbeds()
            .iter()
            .filter(|t| t.answers_to(name))
            .map(|t| t.host.clone())
            .collect();
        if matched.is_empty() {
            bail!("no testbed answers to {name:?}");
        }
        for host in matched {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }
    Ok(hosts)
}

/// Print the inventory
fn cmd_show(inventory: &Inventory) -> Result<()> {
    println!("Testbeds:");
    for testbed in inventory.testbeds() {
        println!(
            "  {:<24} {:<16} {}",
            testbed.host.as_str(),
            testbed.role,
            testbed.aliases.join(", ")
        );
    }

    if !inventory.groups().is_empty() {
        println!();
        println!("Groups:");
        for (name, hosts) in inventory.groups() {
            let hosts: Vec<&str> = hosts.iter().map(HostId::as_str).collect();
            println!("  {:<16} {}", name, hosts.join(", "));
        }
    }

    println!();
    println!("Jobs:");
    for job in inventory.jobs() {
        let mut flags = Vec::new();
        if let Some(bundle) = &job.bundle {
            flags.push(format!("bundle={bundle}"));
        }
        if job.stress {
            flags.push("stress".to_string());
        }
        if job.settle {
            flags.push("settle".to_string());
        }
        println!("  {} {}", job.name, flags.join(" "));
        for target in &job.targets {
            println!("    {:<16} {}", target.alias, target.description);
        }
    }

    if !inventory.bundles().is_empty() {
        println!();
        println!("Bundles:");
        for bundle in inventory.bundles() {
            let names: Vec<&str> = bundle.components.iter().map(|(n, _)| n.as_str()).collect();
            println!("  {:<16} {}", bundle.name, names.join(", "));
        }
    }

    println!();
    println!("Constants:");
    for (key, value) in constant_lines(inventory.constants(), inventory.run_config()) {
        println!("  {key:<16} {value}");
    }
    Ok(())
}

fn constant_lines(constants: &Constants, config: &RunConfig) -> Vec<(&'static str, String)> {
    let mut lines = vec![
        ("root", constants.root.display().to_string()),
        ("stress", format!("{}s", constants.stress_duration.as_secs())),
        ("reboot_settle", format!("{}s", constants.reboot_settle.as_secs())),
        ("agent_port", config.agent_port.to_string()),
        ("max_attempts", config.retry.max_attempts.to_string()),
    ];
    if let Some(url) = &constants.report_url {
        lines.push(("report_url", url.clone()));
    }
    if let Some(database) = &constants.database {
        lines.push(("database", database.clone()));
    }
    if let Some(contact) = &constants.contact {
        lines.push(("contact", contact.clone()));
    }
    lines
}

/// Check that the agent on each host answers
async fn cmd_ping(
    inventory: &Inventory,
    connector: Arc<dyn AgentConnector>,
    names: &[String],
) -> Result<()> {
    let hosts = select_hosts(inventory, names)?;
    let mut unreachable = 0;
    for host in &hosts {
        let answer = async {
            let mut session = connector.connect(host).await?;
            let response = session.call(&Request::Ping).await?;
            anyhow::Ok(response)
        }
        .await;
        match answer {
            Ok(Response::Pong { version, hostname }) => {
                println!("{host}: agent {version} on {hostname}");
            }
            Ok(other) => {
                unreachable += 1;
                println!("{host}: unexpected answer {}", other.name());
            }
            Err(e) => {
                unreachable += 1;
                println!("{host}: unreachable ({e})");
            }
        }
    }
    if unreachable > 0 {
        bail!("{unreachable} of {} host(s) did not answer", hosts.len());
    }
    Ok(())
}

/// Empty the staging root on each host
async fn cmd_clean(
    inventory: &Inventory,
    connector: Arc<dyn AgentConnector>,
    names: &[String],
) -> Result<()> {
    let hosts = select_hosts(inventory, names)?;
    let root = inventory.constants().root.display().to_string();
    let mut failed = 0;
    for host in &hosts {
        let request = Request::Cleanup(CleanupRequest {
            assignment_id: Uuid::nil(),
            path: root.clone(),
        });
        let answer = async {
            let mut session = connector.connect(host).await?;
            anyhow::Ok(session.call(&request).await?)
        }
        .await;
        match answer {
            Ok(Response::CleanedUp { .. }) => println!("{host}: cleaned {root}"),
            Ok(Response::Error(e)) => {
                failed += 1;
                println!("{host}: {}", e.message);
            }
            Ok(other) => {
                failed += 1;
                println!("{host}: unexpected answer {}", other.name());
            }
            Err(e) => {
                failed += 1;
                println!("{host}: unreachable ({e})");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} host(s) not cleaned", hosts.len());
    }
    Ok(())
}

/// Dispatch jobs in one session, printing results as they complete
async fn cmd_run(
    inventory: Arc<Inventory>,
    config: RunConfig,
    connector: Arc<dyn AgentConnector>,
    jobs: Vec<String>,
    label: Option<String>,
    results: &Path,
) -> Result<SessionSummary> {
    if jobs.is_empty() {
        bail!("no jobs given; name some or pass --all");
    }
    let sink = JsonlResultSink::open(results)
        .await
        .with_context(|| format!("Failed to open results file {}", results.display()))?;
    let constants = config.constants.clone();
    let orchestrator = Orchestrator::new(inventory, config, connector, Arc::new(sink));

    let session = match label {
        Some(label) => Session::with_label(label, jobs.clone()),
        None => Session::new(jobs.clone()),
    };
    let names: Vec<&str> = jobs.iter().map(String::as_str).collect();
    let mut run = orchestrator
        .run_jobs(&names, session)
        .context("Failed to plan jobs")?;
    info!(session_id = %run.session_id(), assignments = run.expected(), "session started");
    println!("Session {} ({} assignment(s))", run.session_id(), run.expected());

    let abort = run.abort_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; aborting session");
            abort.abort();
        }
    });

    while let Some(result) = run.next().await {
        println!("{}", format_result(&result));
        let session = result.session_id.to_string();
        if let Some(link) = constants.report_link(&session, result.host.as_str()) {
            println!("      log: {link}");
        }
    }
    let (_, summary) = run.finish().await;
    interrupt.abort();

    let summary = summary.context("Session ended without a summary")?;
    println!(
        "Session {} closed: {} total, {} passed, {} failed, {} errors, {} timeouts, {} aborted",
        summary.id,
        summary.total,
        summary.passed,
        summary.failed,
        summary.errors,
        summary.timeouts,
        summary.aborted
    );
    println!("Results written to {}", results.display());
    Ok(summary)
}

fn format_result(result: &ExecutionResult) -> String {
    let mut line = format!(
        "{:<8} {:<24} {}/{} ({} ms)",
        result.outcome.as_str().to_uppercase(),
        result.host.as_str(),
        result.job,
        result.alias,
        result.duration_ms
    );
    if let Some(code) = result.exit_status {
        line.push_str(&format!(" exit {code}"));
    }
    if let Some(failure) = &result.failure {
        line.push_str(&format!(": {}", failure.message));
    }
    line
}

/// Run one command through the driver. Returns its exit code.
async fn cmd_local(command: &[String], timeout: Duration) -> Result<Option<i32>> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    let spec = CommandSpec::new(program)
        .args(args.iter().cloned())
        .timeout(timeout);

    let (tx, mut rx) = mpsc::unbounded_channel::<TaggedLine>();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", render_line(&line));
        }
    });
    let outcome = Driver::new().run_with_sink(&spec, Some(tx)).await;
    if let Err(e) = printer.await {
        warn!(error = %e, "output printer failed");
    }

    match outcome {
        Ok(output) => {
            for failure in &output.reader_failures {
                warn!(failure = %failure, "output stream degraded");
            }
            for stream in &output.lingering {
                warn!(stream = stream.as_str(), "output stream still open after exit");
            }
            match output.exit_status {
                Some(code) => println!("ExitValue: {code}"),
                None => println!("ExitValue: killed"),
            }
            Ok(output.exit_status)
        }
        Err(DriverError::TimeoutExceeded { timeout, .. }) => {
            println!("ExitValue: timeout");
            bail!("command exceeded its {}s timeout", timeout.as_secs())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to run {program}")),
    }
}

fn render_line(line: &TaggedLine) -> String {
    match line.stream {
        StreamKind::Stdout => format!("OUTPUT>{}", line.line),
        StreamKind::Stderr => format!("ERROR>{}", line.line),
    }
}
