//! Testbed agent daemon.
//!
//! Runs on every target host. Listens for orchestrator connections and
//! serves `Ping`, `Stage`, `Execute` and `Cleanup` against a staging root.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use testbed_core::{init_tracing, LogFormat, DEFAULT_AGENT_PORT, DEFAULT_STAGING_ROOT};
use testbed_dispatch::Agent;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "testbed-agent")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resident agent for the testbed orchestrator", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// TCP port to listen on
    #[arg(short, long, env = "TESTBED_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    port: u16,

    /// Staging root; assignments are staged and run below it. Must match
    /// `constants.root` of the inventory
    #[arg(short, long, env = "TESTBED_AGENT_ROOT", default_value = DEFAULT_STAGING_ROOT)]
    root: PathBuf,

    /// Hostname reported in `Pong` (default: detected)
    #[arg(long)]
    hostname: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    fn build_agent(&self) -> Agent {
        let agent = Agent::new(&self.root);
        match &self.hostname {
            Some(name) => agent.with_hostname(name),
            None => agent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(args.json), level);

    tokio::fs::create_dir_all(&args.root)
        .await
        .with_context(|| format!("Failed to create staging root {}", args.root.display()))?;

    let listener = TcpListener::bind(args.addr())
        .await
        .with_context(|| format!("Failed to listen on {}", args.addr()))?;
    let agent = Arc::new(args.build_agent());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = agent.hostname(),
        "testbed-agent started"
    );

    tokio::select! {
        served = agent.serve(listener) => served.context("Agent stopped accepting connections")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_core::RunConfig;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["testbed-agent"]);
        assert_eq!(args.port, DEFAULT_AGENT_PORT);
        assert_eq!(args.addr().to_string(), format!("0.0.0.0:{DEFAULT_AGENT_PORT}"));
        assert!(!args.json);
    }

    #[test]
    fn test_default_root_matches_inventory_default() {
        let args = Args::parse_from(["testbed-agent"]);
        assert_eq!(args.root, RunConfig::default().constants.root);

        // An orchestrator using the default root stages where this agent accepts.
        let agent = args.build_agent();
        assert_eq!(agent.root(), RunConfig::default().constants.root.as_path());
    }

    #[test]
    fn test_relative_root_is_resolved() {
        let args = Args::parse_from(["testbed-agent", "--root", "scratch/testbed"]);
        let agent = args.build_agent();
        assert!(agent.root().is_absolute());
        assert!(agent.root().ends_with("scratch/testbed"));
    }

    #[test]
    fn test_hostname_override() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let args = Args::parse_from([
            "testbed-agent",
            "--root",
            root,
            "--hostname",
            "hardy.lab",
            "--port",
            "9000",
        ]);
        let agent = args.build_agent();
        assert_eq!(agent.hostname(), "hardy.lab");
        assert_eq!(agent.root(), dir.path());
        assert_eq!(args.port, 9000);
    }
}
