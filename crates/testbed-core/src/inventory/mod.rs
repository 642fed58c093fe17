//! Inventory Model.
//!
//! Typed, immutable view of the testbeds, jobs, and test-suite bundles
//! declared in the inventory document. Built once at startup and then only
//! read, so it can be shared across dispatch workers behind an `Arc`
//! without locking.
//!
//! An alias names a target of a job. It matches a testbed whose host,
//! role, or one of whose declared aliases equals it, and must match exactly
//! one testbed.

pub mod document;

use std::path::{Path, PathBuf};

use testbed_state::HostId;
use tracing::debug;

use crate::assignment::Assignment;
use crate::config::{Constants, RunConfig};
use crate::error::{ConfigResult, ConfigurationError};
use document::{InventoryDocument, JobDoc};

/// A declared target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testbed {
    pub host: HostId,
    pub role: String,
    pub aliases: Vec<String>,
}

impl Testbed {
    pub fn answers_to(&self, alias: &str) -> bool {
        self.host.as_str() == alias || self.role == alias || self.aliases.iter().any(|a| a == alias)
    }
}

/// One target of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTarget {
    pub alias: String,
    pub description: String,
}

/// A named test activity bound to one or more target aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub targets: Vec<JobTarget>,
    pub bundle: Option<String>,
    /// Command template; first element is the program
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub timeout_secs: Option<u64>,
    pub stress: bool,
    pub settle: bool,
}

impl JobSpec {
    fn from_doc(name: &str, doc: &JobDoc) -> Self {
        Self {
            name: name.to_string(),
            targets: doc
                .targets
                .iter()
                .map(|(alias, description)| JobTarget {
                    alias: alias.to_string(),
                    description: description.clone(),
                })
                .collect(),
            bundle: doc.bundle.clone(),
            command: doc.command.clone(),
            working_dir: doc.working_dir.clone(),
            timeout_secs: doc.timeout_secs,
            stress: doc.stress,
            settle: doc.settle,
        }
    }
}

/// A named set of artifacts required by a class of jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub name: String,
    /// (component name, description)
    pub components: Vec<(String, String)>,
}

/// A local file that must be staged onto the target before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub name: String,
    pub path: PathBuf,
}

impl ArtifactSource {
    /// File name the artifact has once staged.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// A resolved (job, alias, host) triple, before a command is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentCandidate {
    pub job: String,
    pub alias: String,
    pub description: String,
    pub host: HostId,
}

/// The validated, read-only inventory.
#[derive(Debug, Clone)]
pub struct Inventory {
    testbeds: Vec<Testbed>,
    groups: Vec<(String, Vec<HostId>)>,
    jobs: Vec<JobSpec>,
    bundles: Vec<Bundle>,
    packages: Vec<(String, Vec<String>)>,
    platforms: Vec<String>,
    config: RunConfig,
}

impl Inventory {
    /// Read and validate an inventory file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let doc: InventoryDocument = serde_yaml::from_str(text)?;
        Self::from_document(doc)
    }

    /// Validate a parsed document.
    ///
    /// Structural problems (duplicate hosts, jobs without targets or
    /// command, group members that are not testbeds, bundles naming
    /// components without an artifact path) are rejected here. Alias
    /// resolution is checked per job at dispatch time.
    pub fn from_document(doc: InventoryDocument) -> ConfigResult<Self> {
        let mut testbeds: Vec<Testbed> = Vec::with_capacity(doc.testbeds.len());
        for tb in &doc.testbeds {
            if tb.host.trim().is_empty() {
                return Err(invalid("testbed with empty host"));
            }
            if testbeds.iter().any(|t| t.host.as_str() == tb.host) {
                return Err(invalid(format!("testbed {} declared twice", tb.host)));
            }
            testbeds.push(Testbed {
                host: HostId::new(tb.host.clone()),
                role: tb.role.clone(),
                aliases: tb.aliases.clone(),
            });
        }

        let mut groups = Vec::with_capacity(doc.groups.len());
        for (name, hosts) in doc.groups.iter() {
            let mut members = Vec::with_capacity(hosts.len());
            for host in hosts {
                if !testbeds.iter().any(|t| t.host.as_str() == host) {
                    return Err(invalid(format!(
                        "group {name} lists {host}, which is not a testbed"
                    )));
                }
                members.push(HostId::new(host.clone()));
            }
            groups.push((name.to_string(), members));
        }

        let mut bundles = Vec::with_capacity(doc.testsuite.len());
        for (name, components) in doc.testsuite.iter() {
            for (component, _) in components.iter() {
                if !doc.constants.artifacts.contains_key(component) {
                    return Err(ConfigurationError::UnknownComponent {
                        bundle: name.to_string(),
                        component: component.to_string(),
                    });
                }
            }
            bundles.push(Bundle {
                name: name.to_string(),
                components: components
                    .iter()
                    .map(|(c, d)| (c.to_string(), d.clone()))
                    .collect(),
            });
        }

        let mut jobs: Vec<JobSpec> = Vec::with_capacity(doc.jobs.len());
        for (name, job) in doc.jobs.iter() {
            if job.targets.is_empty() {
                return Err(invalid(format!("job {name} has no targets")));
            }
            if job.command.is_empty() {
                return Err(invalid(format!("job {name} has an empty command")));
            }
            if jobs.iter().any(|j| j.name == name) {
                return Err(invalid(format!("job {name} declared twice")));
            }
            jobs.push(JobSpec::from_doc(name, job));
        }

        let inventory = Self {
            testbeds,
            groups,
            jobs,
            bundles,
            packages: doc
                .packages
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            platforms: doc.platforms.clone(),
            config: RunConfig::from_doc(&doc.constants),
        };
        debug!(
            testbeds = inventory.testbeds.len(),
            jobs = inventory.jobs.len(),
            bundles = inventory.bundles.len(),
            "inventory loaded"
        );
        Ok(inventory)
    }

    /// Resolve a job to one candidate per target alias, in declaration order.
    pub fn resolve_job(&self, job: &str) -> ConfigResult<Vec<AssignmentCandidate>> {
        let spec = self.job(job).ok_or_else(|| ConfigurationError::UnknownJob {
            job: job.to_string(),
        })?;

        let mut candidates = Vec::with_capacity(spec.targets.len());
        for target in &spec.targets {
            let host = self.resolve_alias(job, &target.alias)?;
            candidates.push(AssignmentCandidate {
                job: spec.name.clone(),
                alias: target.alias.clone(),
                description: target.description.clone(),
                host,
            });
        }
        Ok(candidates)
    }

    fn resolve_alias(&self, job: &str, alias: &str) -> ConfigResult<HostId> {
        let matches: Vec<&Testbed> = self
            .testbeds
            .iter()
            .filter(|t| t.answers_to(alias))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.host.clone()),
            [] => Err(ConfigurationError::UnresolvedAlias {
                job: job.to_string(),
                alias: alias.to_string(),
            }),
            many => Err(ConfigurationError::AmbiguousAlias {
                job: job.to_string(),
                alias: alias.to_string(),
                hosts: many
                    .iter()
                    .map(|t| t.host.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Hosts carrying `role`, in declaration order.
    pub fn hosts_for_role(&self, role: &str) -> Vec<HostId> {
        self.testbeds
            .iter()
            .filter(|t| t.role == role)
            .map(|t| t.host.clone())
            .collect()
    }

    /// Artifacts a bundle requires, resolved to local paths.
    pub fn bundle_artifacts(&self, bundle: &str) -> Option<Vec<ArtifactSource>> {
        let bundle = self.bundles.iter().find(|b| b.name == bundle)?;
        bundle
            .components
            .iter()
            .map(|(component, _)| {
                self.config
                    .constants
                    .artifacts
                    .get(component)
                    .map(|path| ArtifactSource {
                        name: component.clone(),
                        path: path.clone(),
                    })
            })
            .collect()
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn testbeds(&self) -> &[Testbed] {
        &self.testbeds
    }

    pub fn testbed(&self, host: &HostId) -> Option<&Testbed> {
        self.testbeds.iter().find(|t| &t.host == host)
    }

    pub fn group(&self, name: &str) -> Option<&[HostId]> {
        self.groups
            .iter()
            .find(|(g, _)| g == name)
            .map(|(_, hosts)| hosts.as_slice())
    }

    pub fn groups(&self) -> &[(String, Vec<HostId>)] {
        &self.groups
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn packages(&self, set: &str) -> Option<&[String]> {
        self.packages
            .iter()
            .find(|(name, _)| name == set)
            .map(|(_, pkgs)| pkgs.as_slice())
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Run configuration derived from the document's constants.
    pub fn run_config(&self) -> &RunConfig {
        &self.config
    }

    pub fn constants(&self) -> &Constants {
        &self.config.constants
    }

    /// Resolve `job` and build its assignments against `config`.
    pub fn plan_job(&self, job: &str, config: &RunConfig) -> ConfigResult<Vec<Assignment>> {
        crate::assignment::plan_job(self, config, job)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidDocument(msg.into())
}
