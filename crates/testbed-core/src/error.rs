//! Configuration error taxonomy.
//!
//! Everything here is fatal to the job request that triggered it and is
//! raised before any dispatch happens. None of it is retried.

use std::path::PathBuf;

/// Errors produced while loading the inventory or resolving a job.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid inventory: {0}")]
    InvalidDocument(String),

    #[error("unknown job: {job}")]
    UnknownJob { job: String },

    #[error("job {job}: alias {alias} does not match any testbed")]
    UnresolvedAlias { job: String, alias: String },

    #[error("job {job}: alias {alias} matches several testbeds ({hosts})")]
    AmbiguousAlias {
        job: String,
        alias: String,
        hosts: String,
    },

    #[error("job {job}: unknown test-suite bundle {bundle}")]
    UnknownBundle { job: String, bundle: String },

    #[error("bundle {bundle}: component {component} has no artifact path")]
    UnknownComponent { bundle: String, component: String },

    #[error("job {job}: bad command template {template:?}: {reason}")]
    InvalidTemplate {
        job: String,
        template: String,
        reason: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
