//! Package managers: live inventory, planning against desired state, applying
//! change-sets and measuring what is left over. Every command goes through an
//! [`Executor`], so inventory queries are gated like any other call.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hcv_core::{ExecRequest, ExecResult, Executor, FailureKind};

use crate::desired::DesiredState;
use crate::plan::{tool_name, tool_version, ChangeSet, Subsystem};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("{subsystem} inventory command failed ({kind}): {stderr}")]
    Command {
        subsystem: Subsystem,
        kind: &'static str,
        stderr: String,
    },
    #[error("{subsystem} inventory output unparseable: {source}")]
    Parse {
        subsystem: Subsystem,
        #[source]
        source: serde_json::Error,
    },
}

/// One mutating command that did not succeed.
#[derive(Debug, Clone, Serialize)]
pub struct OpFailure {
    pub subsystem: Subsystem,
    pub command: String,
    pub kind: FailureKind,
    pub code: i32,
    pub stderr: String,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    /// `None` when `desired` carries nothing for this manager.
    async fn plan(&self, desired: &DesiredState) -> Result<Option<ChangeSet>, InventoryError>;

    /// Runs every operation in `changes`, continuing past failures.
    async fn apply(&self, changes: &ChangeSet) -> Vec<OpFailure>;

    /// Items of `changes` that live state still does not reflect.
    async fn residual(&self, changes: &ChangeSet) -> Result<ChangeSet, InventoryError>;
}

fn excerpt(s: &str) -> String {
    const MAX: usize = 512;
    let t = s.trim();
    if t.len() <= MAX {
        return t.to_string();
    }
    let mut end = MAX;
    while !t.is_char_boundary(end) {
        end -= 1;
    }
    t[..end].to_string()
}

async fn run_op(
    exec: &dyn Executor,
    subsystem: Subsystem,
    program: &str,
    args: &[&str],
    failures: &mut Vec<OpFailure>,
) {
    let res = exec.execute(ExecRequest::new(program, args.iter().copied())).await;
    if let Some(kind) = res.failure_kind() {
        let command = format!("{program} {}", args.join(" "));
        tracing::warn!(%subsystem, %command, code = res.code, "package operation failed");
        failures.push(OpFailure {
            subsystem,
            command,
            kind,
            code: res.code,
            stderr: excerpt(&res.stderr),
        });
    }
}

fn require_ok(subsystem: Subsystem, res: ExecResult) -> Result<String, InventoryError> {
    match res.failure_kind() {
        None => Ok(res.stdout),
        Some(kind) => Err(InventoryError::Command {
            subsystem,
            kind: kind.as_str(),
            stderr: excerpt(&res.stderr),
        }),
    }
}

/// Formula names from `brew info --json=v2` / `brew outdated --json=v2`.
pub fn parse_brew_formulae(stdout: &str) -> Result<BTreeSet<String>, serde_json::Error> {
    if stdout.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    let doc: Value = serde_json::from_str(stdout)?;
    Ok(doc
        .get("formulae")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|f| f.get("name").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default())
}

/// Tool -> version from `mise ls --json`, which is either a map of tool
/// name to install list or a flat array of installs.
pub fn parse_mise_list(stdout: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
    if stdout.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let doc: Value = serde_json::from_str(stdout)?;
    let mut out = BTreeMap::new();
    match &doc {
        Value::Array(items) => items.iter().for_each(|it| mise_entry(&mut out, None, it)),
        Value::Object(map) => {
            for (tool, entry) in map {
                match entry {
                    Value::Array(installs) => installs
                        .iter()
                        .for_each(|it| mise_entry(&mut out, Some(tool.as_str()), it)),
                    other => mise_entry(&mut out, Some(tool.as_str()), other),
                }
            }
        }
        _ => {}
    }
    Ok(out)
}

fn mise_entry(out: &mut BTreeMap<String, String>, fallback_name: Option<&str>, item: &Value) {
    let name = item
        .get("plugin")
        .or_else(|| item.get("name"))
        .and_then(Value::as_str)
        .or(fallback_name);
    let version = item
        .get("version")
        .or_else(|| item.get("current"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        out.entry(name.to_string())
            .or_insert_with(|| version.to_string());
    }
}

/// Installed `have` satisfies requested `want` when equal, when `want` is a
/// version prefix (`20` matches `20.11.1`), or when `want` is `latest`.
pub fn version_satisfies(have: &str, want: &str) -> bool {
    if have.is_empty() {
        return false;
    }
    want == "latest" || have == want || have.starts_with(&format!("{want}."))
}

pub struct Brew {
    exec: Arc<dyn Executor>,
}

impl Brew {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    pub async fn installed(&self) -> Result<BTreeSet<String>, InventoryError> {
        let res = self
            .exec
            .execute(ExecRequest::new("brew", ["info", "--json=v2", "--installed"]))
            .await;
        let out = require_ok(Subsystem::Brew, res)?;
        parse_brew_formulae(&out).map_err(|source| InventoryError::Parse {
            subsystem: Subsystem::Brew,
            source,
        })
    }

    pub async fn outdated(&self) -> Result<BTreeSet<String>, InventoryError> {
        let res = self
            .exec
            .execute(ExecRequest::new("brew", ["outdated", "--json=v2"]))
            .await;
        let out = require_ok(Subsystem::Brew, res)?;
        parse_brew_formulae(&out).map_err(|source| InventoryError::Parse {
            subsystem: Subsystem::Brew,
            source,
        })
    }
}

#[async_trait]
impl PackageManager for Brew {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Brew
    }

    async fn plan(&self, desired: &DesiredState) -> Result<Option<ChangeSet>, InventoryError> {
        let Some(want) = &desired.brew else {
            return Ok(None);
        };
        let installed = self.installed().await?;
        let outdated = self.outdated().await?;
        Ok(Some(ChangeSet {
            installs: want.difference(&installed).cloned().collect(),
            upgrades: want
                .intersection(&installed)
                .filter(|n| outdated.contains(*n))
                .cloned()
                .collect(),
            uninstalls: installed.difference(want).cloned().collect(),
        }))
    }

    async fn apply(&self, changes: &ChangeSet) -> Vec<OpFailure> {
        let mut failures = Vec::new();
        let exec = self.exec.as_ref();
        for name in &changes.installs {
            run_op(exec, Subsystem::Brew, "brew", &["install", name.as_str()], &mut failures).await;
        }
        for name in &changes.upgrades {
            run_op(exec, Subsystem::Brew, "brew", &["upgrade", name.as_str()], &mut failures).await;
        }
        for name in &changes.uninstalls {
            run_op(exec, Subsystem::Brew, "brew", &["uninstall", name.as_str()], &mut failures).await;
        }
        failures
    }

    async fn residual(&self, changes: &ChangeSet) -> Result<ChangeSet, InventoryError> {
        if changes.is_empty() {
            return Ok(ChangeSet::default());
        }
        let installed = self.installed().await?;
        let outdated = if changes.upgrades.is_empty() {
            BTreeSet::new()
        } else {
            self.outdated().await?
        };
        Ok(ChangeSet {
            installs: changes
                .installs
                .iter()
                .filter(|n| !installed.contains(*n))
                .cloned()
                .collect(),
            upgrades: changes
                .upgrades
                .iter()
                .filter(|n| outdated.contains(*n))
                .cloned()
                .collect(),
            uninstalls: changes
                .uninstalls
                .iter()
                .filter(|n| installed.contains(*n))
                .cloned()
                .collect(),
        })
    }
}

pub struct Mise {
    exec: Arc<dyn Executor>,
}

impl Mise {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    pub async fn installed(&self) -> Result<BTreeMap<String, String>, InventoryError> {
        let res = self.exec.execute(ExecRequest::new("mise", ["ls", "--json"])).await;
        let out = require_ok(Subsystem::Mise, res)?;
        parse_mise_list(&out).map_err(|source| InventoryError::Parse {
            subsystem: Subsystem::Mise,
            source,
        })
    }
}

#[async_trait]
impl PackageManager for Mise {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Mise
    }

    async fn plan(&self, desired: &DesiredState) -> Result<Option<ChangeSet>, InventoryError> {
        let Some(want) = &desired.mise else {
            return Ok(None);
        };
        let live = self.installed().await?;
        let mut cs = ChangeSet::default();
        for (tool, version) in want {
            match live.get(tool) {
                None => cs.installs.push(format!("{tool}@{version}")),
                Some(have) if !version_satisfies(have, version) => {
                    cs.upgrades.push(format!("{tool}@{version}"))
                }
                Some(_) => {}
            }
        }
        cs.uninstalls = live.keys().filter(|t| !want.contains_key(*t)).cloned().collect();
        Ok(Some(cs))
    }

    async fn apply(&self, changes: &ChangeSet) -> Vec<OpFailure> {
        let mut failures = Vec::new();
        let exec = self.exec.as_ref();
        let specs: Vec<&String> = changes.installs.iter().chain(&changes.upgrades).collect();
        for spec in &specs {
            run_op(exec, Subsystem::Mise, "mise", &["use", "-g", spec.as_str()], &mut failures).await;
        }
        if !specs.is_empty() {
            run_op(exec, Subsystem::Mise, "mise", &["install"], &mut failures).await;
        }
        for tool in &changes.uninstalls {
            run_op(exec, Subsystem::Mise, "mise", &["uninstall", tool.as_str()], &mut failures).await;
        }
        failures
    }

    async fn residual(&self, changes: &ChangeSet) -> Result<ChangeSet, InventoryError> {
        if changes.is_empty() {
            return Ok(ChangeSet::default());
        }
        let live = self.installed().await?;
        let unmet = |spec: &&String| {
            let have = live.get(tool_name(spec)).map(String::as_str).unwrap_or_default();
            !version_satisfies(have, tool_version(spec).unwrap_or("latest"))
        };
        Ok(ChangeSet {
            installs: changes.installs.iter().filter(unmet).cloned().collect(),
            upgrades: changes.upgrades.iter().filter(unmet).cloned().collect(),
            uninstalls: changes
                .uninstalls
                .iter()
                .filter(|t| live.contains_key(tool_name(t)))
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brew_json_names() {
        let out = r#"{"formulae":[{"name":"wget"},{"name":"jq"}],"casks":[{"token":"x"}]}"#;
        let names: Vec<_> = parse_brew_formulae(out).unwrap().into_iter().collect();
        assert_eq!(names, vec!["jq", "wget"]);
        assert!(parse_brew_formulae("").unwrap().is_empty());
        assert!(parse_brew_formulae("{nope").is_err());
    }

    #[test]
    fn mise_list_map_and_array_forms() {
        let map = r#"{"node":[{"version":"20.11.1","active":true}],"python":[{"version":"3.12.1"}]}"#;
        let m = parse_mise_list(map).unwrap();
        assert_eq!(m["node"], "20.11.1");
        assert_eq!(m["python"], "3.12.1");

        let arr = r#"[{"plugin":"go","version":"1.22.0"},{"name":"deno","current":"1.40"},{"version":"x"}]"#;
        let a = parse_mise_list(arr).unwrap();
        assert_eq!(a["go"], "1.22.0");
        assert_eq!(a["deno"], "1.40");
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn version_prefix_rules() {
        assert!(version_satisfies("20.11.1", "20"));
        assert!(version_satisfies("20.11.1", "20.11.1"));
        assert!(version_satisfies("1.2", "latest"));
        assert!(!version_satisfies("200.1", "20"));
        assert!(!version_satisfies("", "latest"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let long = "é".repeat(400);
        let e = excerpt(&long);
        assert!(e.len() <= 512);
        assert!(e.chars().all(|c| c == 'é'));
    }
}
