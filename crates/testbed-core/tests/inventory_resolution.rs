//! Loading an inventory file from disk and planning jobs against it.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use testbed_core::{ConfigurationError, HostId, Inventory};

const LAB: &str = r#"
testbeds:
  - host: dapper.lab
    role: kernel_test
    aliases: [dapper]
  - host: hardy.lab
    role: kernel_test
    aliases: [hardy]
  - host: fs1.lab
    role: file_server
    aliases: [server]
groups:
  kernel: [dapper.lab, hardy.lab]
jobs:
  dbench:
    targets:
      dapper: Ubuntu 6.06 dbench
      hardy: Ubuntu 8.04 dbench
      server: file server dbench
    command: [dbench, "-t", "{STRESS_SECS}", "64"]
    stress: true
  unixbench:
    targets:
      hardy: UnixBench on hardy
    bundle: bench
    command: ["sh", "-c", "tar xzf {UNIXBENCH} && ./Run"]
    working_dir: "{ROOT}/unixbench"
packages:
  kernel: [build-essential, flex, bison]
platforms: [i386, x86_64]
testsuite:
  bench:
    UNIXBENCH: UnixBench sources
constants:
  root: /var/tmp/testbed
  stress_duration_secs: 1800
  stress_grace_secs: 120
  artifacts:
    UNIXBENCH: /srv/artifacts/unixbench-4.1.0.tgz
  policy:
    max_attempts: 5
    pass_exit_codes: [0]
"#;

fn write_lab() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LAB.as_bytes()).unwrap();
    file
}

#[test]
fn load_from_file_and_plan_every_target() {
    let file = write_lab();
    let inventory = Inventory::load(file.path()).unwrap();
    let config = inventory.run_config().clone();
    assert_eq!(config.retry.max_attempts, 5);

    let plan = inventory.plan_job("dbench", &config).unwrap();
    let targets: Vec<(&str, &str)> = plan
        .iter()
        .map(|a| (a.alias.as_str(), a.host.as_str()))
        .collect();
    assert_eq!(
        targets,
        vec![
            ("dapper", "dapper.lab"),
            ("hardy", "hardy.lab"),
            ("server", "fs1.lab"),
        ]
    );
    assert!(plan.iter().all(|a| a.timeout == Duration::from_secs(1920)));
    assert!(plan.iter().all(|a| a.args == vec!["-t", "1800", "64"]));
}

#[test]
fn bundle_artifacts_flow_into_assignment() {
    let inventory = Inventory::from_yaml_str(LAB).unwrap();
    let plan = inventory
        .plan_job("unixbench", inventory.run_config())
        .unwrap();

    assert_eq!(plan.len(), 1);
    let a = &plan[0];
    assert_eq!(a.host, HostId::from("hardy.lab"));
    assert_eq!(a.artifacts[0].name, "UNIXBENCH");
    assert_eq!(a.args[1], "tar xzf unixbench-4.1.0.tgz && ./Run");
    assert_eq!(a.working_dir.as_deref(), Some("/var/tmp/testbed/unixbench"));
    assert_eq!(a.timeout, inventory.run_config().default_timeout);
}

#[test]
fn lookups_expose_the_document() {
    let inventory = Inventory::from_yaml_str(LAB).unwrap();
    assert_eq!(inventory.testbeds().len(), 3);
    assert_eq!(inventory.jobs().len(), 2);
    assert_eq!(
        inventory.packages("kernel").unwrap(),
        &["build-essential", "flex", "bison"]
    );
    assert_eq!(inventory.platforms(), &["i386", "x86_64"]);
    assert_eq!(inventory.constants().stress_duration, Duration::from_secs(1800));
    assert_eq!(
        inventory.testbed(&HostId::from("fs1.lab")).map(|t| t.role.as_str()),
        Some("file_server")
    );
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Inventory::load(dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(err, ConfigurationError::Io { .. }));
}

#[test]
fn malformed_yaml_is_parse_error() {
    let err = Inventory::from_yaml_str("testbeds: [unclosed").unwrap_err();
    assert!(matches!(err, ConfigurationError::Parse(_)));
}

#[test]
fn sample_inventory_plans_every_job() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testbed.yaml");
    let inventory = Inventory::load(&path).unwrap();
    let config = inventory.run_config().clone();
    for job in inventory.jobs() {
        let plan = inventory.plan_job(&job.name, &config).unwrap();
        assert_eq!(plan.len(), job.targets.len(), "job {}", job.name);
    }

    let dbench = inventory.plan_job("dbench", &config).unwrap();
    assert_eq!(dbench[0].timeout, Duration::from_secs(3600 + 600));
    assert_eq!(inventory.group("kernel").map(|g| g.len()), Some(2));
}
