//! Testbed Core Library
//!
//! The inventory model, run configuration and assignment planning shared by
//! the dispatcher, the agent and the `testbed` CLI.

pub mod assignment;
pub mod config;
pub mod error;
pub mod inventory;
pub mod telemetry;

pub use assignment::{job_timeout, plan_job, Assignment};
pub use config::{
    Constants, OutcomePolicy, RetryPolicy, RunConfig, DEFAULT_AGENT_PORT, DEFAULT_STAGING_ROOT,
};
pub use error::{ConfigResult, ConfigurationError};
pub use inventory::{
    ArtifactSource, AssignmentCandidate, Bundle, Inventory, JobSpec, JobTarget, Testbed,
};
pub use telemetry::{init_tracing, LogFormat};

pub use testbed_state::HostId;
