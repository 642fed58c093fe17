//! Assignments: the unit of dispatch.
//!
//! An assignment is one (job, host, alias) triple with its concrete
//! command, timeout and artifact list. It lives for one execution attempt
//! and is never persisted.

use std::time::Duration;

use testbed_state::HostId;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{ConfigResult, ConfigurationError};
use crate::inventory::{ArtifactSource, AssignmentCandidate, Inventory, JobSpec};

/// One concrete unit of dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub id: Uuid,
    pub job: String,
    pub host: HostId,
    pub alias: String,
    pub description: String,
    pub command: String,
    pub args: Vec<String>,
    /// Working directory on the target; the staging directory when unset
    pub working_dir: Option<String>,
    pub timeout: Duration,
    pub artifacts: Vec<ArtifactSource>,
    /// Wait before dispatching, e.g. to let a freshly rebooted host settle
    pub settle: Option<Duration>,
}

impl Assignment {
    /// The shell-ish one-line rendering used in logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Resolve `job` and build one assignment per target.
///
/// Fails with a [`ConfigurationError`] before anything is dispatched when
/// the job is unknown, an alias does not resolve, the bundle is unknown, or
/// the command template is malformed.
pub fn plan_job(
    inventory: &Inventory,
    config: &RunConfig,
    job: &str,
) -> ConfigResult<Vec<Assignment>> {
    let candidates = inventory.resolve_job(job)?;
    let spec = inventory
        .job(job)
        .ok_or_else(|| ConfigurationError::UnknownJob {
            job: job.to_string(),
        })?;

    let artifacts = match &spec.bundle {
        Some(bundle) => inventory.bundle_artifacts(bundle).ok_or_else(|| {
            ConfigurationError::UnknownBundle {
                job: job.to_string(),
                bundle: bundle.clone(),
            }
        })?,
        None => Vec::new(),
    };

    candidates
        .into_iter()
        .map(|candidate| build(spec, candidate, &artifacts, config))
        .collect()
}

fn build(
    spec: &JobSpec,
    candidate: AssignmentCandidate,
    artifacts: &[ArtifactSource],
    config: &RunConfig,
) -> ConfigResult<Assignment> {
    let vars = TemplateVars {
        spec,
        candidate: &candidate,
        artifacts,
        config,
    };

    let mut words = Vec::with_capacity(spec.command.len());
    for word in &spec.command {
        words.push(vars.expand(word)?);
    }
    let command = words.remove(0);
    let working_dir = spec
        .working_dir
        .as_deref()
        .map(|dir| vars.expand(dir))
        .transpose()?;

    Ok(Assignment {
        id: Uuid::new_v4(),
        job: candidate.job,
        host: candidate.host,
        alias: candidate.alias,
        description: candidate.description,
        command,
        args: words,
        working_dir,
        timeout: job_timeout(spec, config),
        artifacts: artifacts.to_vec(),
        settle: spec.settle.then_some(config.constants.reboot_settle),
    })
}

/// Stress jobs run for the stress duration plus its grace; everything else
/// uses the job's own timeout or the configured default.
pub fn job_timeout(spec: &JobSpec, config: &RunConfig) -> Duration {
    if spec.stress {
        config.constants.stress_duration + config.constants.stress_grace
    } else {
        spec.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.default_timeout)
    }
}

struct TemplateVars<'a> {
    spec: &'a JobSpec,
    candidate: &'a AssignmentCandidate,
    artifacts: &'a [ArtifactSource],
    config: &'a RunConfig,
}

impl TemplateVars<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        let constants = &self.config.constants;
        let value = match name {
            "ROOT" => constants.root.display().to_string(),
            "HOST" => self.candidate.host.to_string(),
            "ALIAS" => self.candidate.alias.clone(),
            "JOB" => self.spec.name.clone(),
            "DESCRIPTION" => self.candidate.description.clone(),
            "STRESS_SECS" => constants.stress_duration.as_secs().to_string(),
            "STRESS_HOURS" => (constants.stress_duration.as_secs() / 3600).to_string(),
            "REPORT_URL" => constants.report_url.clone()?,
            "DATABASE" => constants.database.clone()?,
            other => {
                if let Some(artifact) = self.artifacts.iter().find(|a| a.name == other) {
                    artifact.file_name()
                } else {
                    constants.extra.get(other)?.clone()
                }
            }
        };
        Some(value)
    }

    /// Replace `{NAME}` placeholders; `{{` and `}}` are literal braces.
    fn expand(&self, template: &str) -> ConfigResult<String> {
        let fail = |reason: String| ConfigurationError::InvalidTemplate {
            job: self.spec.name.clone(),
            template: template.to_string(),
            reason,
        };

        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err(fail("unterminated placeholder".to_string())),
                        }
                    }
                    let value = self
                        .lookup(&name)
                        .ok_or_else(|| fail(format!("unknown placeholder {{{name}}}")))?;
                    out.push_str(&value);
                }
                '}' => return Err(fail("unmatched '}'".to_string())),
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}
