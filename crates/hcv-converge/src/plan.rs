//! Plans are pure data: per-subsystem change-sets computed from desired and
//! live state, with no side effects of their own.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Brew,
    Mise,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::Brew, Subsystem::Mise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Brew => "brew",
            Subsystem::Mise => "mise",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub installs: Vec<String>,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub uninstalls: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.installs.is_empty() && self.upgrades.is_empty() && self.uninstalls.is_empty()
    }

    pub fn total(&self) -> usize {
        self.installs.len() + self.upgrades.len() + self.uninstalls.len()
    }

    fn sort(&mut self) {
        self.installs.sort();
        self.installs.dedup();
        self.upgrades.sort();
        self.upgrades.dedup();
        self.uninstalls.sort();
        self.uninstalls.dedup();
    }
}

/// Change-sets keyed by subsystem. Only planned subsystems are present; the
/// serialized form is `{"brew": {...}, "mise": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    subsystems: BTreeMap<Subsystem, ChangeSet>,
}

/// Per-subsystem item counts, keyed by subsystem name.
pub type Counts = BTreeMap<String, usize>;

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `changes` for `sub`, normalizing order so equal inputs give
    /// byte-identical plans.
    pub fn set(&mut self, sub: Subsystem, mut changes: ChangeSet) {
        changes.sort();
        self.subsystems.insert(sub, changes);
    }

    pub fn get(&self, sub: Subsystem) -> Option<&ChangeSet> {
        self.subsystems.get(&sub)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Subsystem, &ChangeSet)> {
        self.subsystems.iter().map(|(k, v)| (*k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.values().all(ChangeSet::is_empty)
    }

    pub fn total(&self) -> usize {
        self.subsystems.values().map(ChangeSet::total).sum()
    }

    pub fn counts(&self) -> Counts {
        Subsystem::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.get(*s).map_or(0, ChangeSet::total)))
            .collect()
    }

    /// Hex sha256 over the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hcv_kernel::sha256_hex(&bytes)
    }

    /// `brew(inst:1 up:0 rm:0) mise(inst:0 up:0 rm:0)`
    pub fn summary(&self) -> String {
        Subsystem::ALL
            .iter()
            .map(|s| {
                let cs = self.get(*s).cloned().unwrap_or_default();
                format!(
                    "{}(inst:{} up:{} rm:{})",
                    s,
                    cs.installs.len(),
                    cs.upgrades.len(),
                    cs.uninstalls.len()
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Best-effort inverse. Installs become uninstalls and vice versa;
    /// upgrades cannot be reversed because the prior version is unknown.
    pub fn invert(&self) -> Plan {
        let mut out = Plan::new();
        for (sub, cs) in self.iter() {
            let inverse = ChangeSet {
                installs: cs.uninstalls.clone(),
                upgrades: Vec::new(),
                uninstalls: cs
                    .installs
                    .iter()
                    .map(|spec| match sub {
                        Subsystem::Mise => tool_name(spec).to_string(),
                        Subsystem::Brew => spec.clone(),
                    })
                    .collect(),
            };
            out.set(sub, inverse);
        }
        out
    }
}

/// `node@20` -> `node`.
pub fn tool_name(spec: &str) -> &str {
    spec.split_once('@').map_or(spec, |(name, _)| name)
}

/// `node@20` -> `Some("20")`.
pub fn tool_version(spec: &str) -> Option<&str> {
    spec.split_once('@').map(|(_, v)| v)
}
