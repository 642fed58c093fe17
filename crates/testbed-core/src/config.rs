//! Run configuration passed explicitly into the orchestrator and sinks.
//!
//! Nothing here is read from process-wide state, so several sessions with
//! different constants can run side by side in one process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testbed_state::Outcome;

use crate::inventory::document::{ConstantsDoc, PolicyDoc};

/// Default TCP port of the resident agent.
pub const DEFAULT_AGENT_PORT: u16 = 7780;

/// Staging root shared by the inventory default and the agent's `--root`.
pub const DEFAULT_STAGING_ROOT: &str = "/var/tmp/testbed";

/// Named constants of the inventory, typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constants {
    /// Root directory on target hosts under which assignments are staged
    pub root: PathBuf,
    pub stress_duration: Duration,
    /// Extra time granted to stress jobs on top of `stress_duration`
    pub stress_grace: Duration,
    pub reboot_settle: Duration,
    pub report_url: Option<String>,
    pub database: Option<String>,
    pub role: Option<String>,
    pub contact: Option<String>,
    pub artifacts: BTreeMap<String, PathBuf>,
    pub extra: BTreeMap<String, String>,
}

impl Default for Constants {
    fn default() -> Self {
        Constants::from_doc(&ConstantsDoc::default())
    }
}

impl Constants {
    pub fn from_doc(doc: &ConstantsDoc) -> Self {
        Self {
            root: doc.root.clone(),
            stress_duration: Duration::from_secs(doc.stress_duration_secs),
            stress_grace: Duration::from_secs(doc.stress_grace_secs),
            reboot_settle: Duration::from_secs(doc.reboot_settle_secs),
            report_url: doc.report_url.clone(),
            database: doc.database.clone(),
            role: doc.role.clone(),
            contact: doc.contact.clone(),
            artifacts: doc.artifacts.clone(),
            extra: doc.extra.clone(),
        }
    }

    /// Link to a host's log for a session, if a report URL base is set.
    pub fn report_link(&self, session: &str, host: &str) -> Option<String> {
        self.report_url
            .as_ref()
            .map(|base| format!("{}/{}/{}", base.trim_end_matches('/'), session, host))
    }
}

/// Retry policy for connection failures. No other failure is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total connection attempts per assignment (1 = no retry)
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Mapping from a raw exit status to pass/fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomePolicy {
    pub pass_exit_codes: Vec<i32>,
}

impl Default for OutcomePolicy {
    fn default() -> Self {
        Self {
            pass_exit_codes: vec![0],
        }
    }
}

impl OutcomePolicy {
    /// A process killed by a signal has no exit code and counts as a fail.
    pub fn classify(&self, exit_status: Option<i32>) -> Outcome {
        match exit_status {
            Some(code) if self.pass_exit_codes.contains(&code) => Outcome::Pass,
            _ => Outcome::Fail,
        }
    }
}

/// Everything the orchestrator needs besides the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub constants: Constants,
    pub retry: RetryPolicy,
    pub outcome: OutcomePolicy,
    /// Timeout for jobs that declare none
    pub default_timeout: Duration,
    /// Slack on top of an assignment timeout before the orchestrator gives
    /// up on the agent itself
    pub dispatch_grace: Duration,
    pub agent_port: u16,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(Constants::default())
    }
}

impl RunConfig {
    pub fn new(constants: Constants) -> Self {
        Self {
            constants,
            retry: RetryPolicy::default(),
            outcome: OutcomePolicy::default(),
            default_timeout: Duration::from_secs(3600),
            dispatch_grace: Duration::from_secs(30),
            agent_port: DEFAULT_AGENT_PORT,
        }
    }

    /// Build from the document's constants, applying any policy overrides.
    pub fn from_doc(doc: &ConstantsDoc) -> Self {
        let mut config = Self::new(Constants::from_doc(doc));
        config.apply_policy(&doc.policy);
        config
    }

    fn apply_policy(&mut self, policy: &PolicyDoc) {
        if let Some(n) = policy.max_attempts {
            self.retry.max_attempts = n.max(1);
        }
        if let Some(ms) = policy.backoff_base_ms {
            self.retry.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = policy.backoff_max_ms {
            self.retry.backoff_max = Duration::from_millis(ms);
        }
        if let Some(codes) = &policy.pass_exit_codes {
            self.outcome.pass_exit_codes = codes.clone();
        }
        if let Some(secs) = policy.default_timeout_secs {
            self.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = policy.dispatch_grace_secs {
            self.dispatch_grace = Duration::from_secs(secs);
        }
        if let Some(port) = policy.agent_port {
            self.agent_port = port;
        }
    }
}
