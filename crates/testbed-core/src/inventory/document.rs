//! Serde shapes of the YAML inventory document.
//!
//! These mirror the document one-to-one and carry no behaviour; they are
//! validated into [`Inventory`](super::Inventory) exactly once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// A YAML mapping that keeps the document's key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            entries.push((key, value));
        }
        Ok(OrderedMap(entries))
    }

    // An empty YAML key (`jobs:`) parses as null.
    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(OrderedMap::default())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

/// Top-level inventory document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryDocument {
    #[serde(default)]
    pub testbeds: Vec<TestbedDoc>,
    /// Named host lists, e.g. `kernel: [dapper.lab, hardy.lab]`
    #[serde(default)]
    pub groups: OrderedMap<Vec<String>>,
    #[serde(default)]
    pub jobs: OrderedMap<JobDoc>,
    /// Bundle name → component name → description
    #[serde(default)]
    pub testsuite: OrderedMap<OrderedMap<String>>,
    #[serde(default)]
    pub packages: OrderedMap<Vec<String>>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub constants: ConstantsDoc,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestbedDoc {
    pub host: String,
    pub role: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobDoc {
    /// Target alias → human-readable description
    pub targets: OrderedMap<String>,
    #[serde(default)]
    pub bundle: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Runs for the configured stress duration
    #[serde(default)]
    pub stress: bool,
    /// Wait the reboot settle time before the first dispatch on each host
    #[serde(default)]
    pub settle: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantsDoc {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_stress_duration")]
    pub stress_duration_secs: u64,
    #[serde(default = "default_stress_grace")]
    pub stress_grace_secs: u64,
    #[serde(default = "default_reboot_settle")]
    pub reboot_settle_secs: u64,
    #[serde(default)]
    pub report_url: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    /// Component name → local artifact path
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Free-form constants usable as `{NAME}` in command templates
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    #[serde(default)]
    pub policy: PolicyDoc,
}

impl Default for ConstantsDoc {
    fn default() -> Self {
        Self {
            root: default_root(),
            stress_duration_secs: default_stress_duration(),
            stress_grace_secs: default_stress_grace(),
            reboot_settle_secs: default_reboot_settle(),
            report_url: None,
            database: None,
            role: None,
            contact: None,
            artifacts: BTreeMap::new(),
            extra: BTreeMap::new(),
            policy: PolicyDoc::default(),
        }
    }
}

/// Optional overrides of the dispatch policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[serde(default)]
    pub pass_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
    #[serde(default)]
    pub dispatch_grace_secs: Option<u64>,
    #[serde(default)]
    pub agent_port: Option<u16>,
}

fn default_root() -> PathBuf {
    PathBuf::from(crate::config::DEFAULT_STAGING_ROOT)
}

fn default_stress_duration() -> u64 {
    3600
}

fn default_stress_grace() -> u64 {
    600
}

fn default_reboot_settle() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_map_keeps_document_order() {
        let yaml = "zeta: 1\nalpha: 2\nmid: 3\n";
        let map: OrderedMap<u32> = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_empty_sections_parse() {
        let doc: InventoryDocument = serde_yaml::from_str("jobs:\ntestbeds: []\n").unwrap();
        assert!(doc.jobs.is_empty());
        assert_eq!(doc.constants.stress_duration_secs, 3600);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_yaml::from_str::<InventoryDocument>("jbos: {}\n");
        assert!(err.is_err());
    }
}
