//! Desired package state read from a Brewfile and a `mise.toml`.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

static BREW_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*brew\s+"([^"]+)""#).expect("brewfile regex"));

/// Where desired state comes from. A missing source leaves that subsystem
/// unplanned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DesiredSources {
    pub brewfile: Option<PathBuf>,
    pub misefile: Option<PathBuf>,
}

impl DesiredSources {
    /// `Brewfile` and `mise.toml` (or `.mise.toml`) under `dir`, when present.
    pub fn from_dir(dir: &Path) -> Self {
        let brewfile = Some(dir.join("Brewfile")).filter(|p| p.is_file());
        let misefile = ["mise.toml", ".mise.toml"]
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file());
        Self { brewfile, misefile }
    }

    pub fn load(&self) -> Result<DesiredState> {
        let brew = match &self.brewfile {
            Some(p) if p.is_file() => {
                let txt = std::fs::read_to_string(p)
                    .with_context(|| format!("read {}", p.display()))?;
                Some(parse_brewfile(&txt))
            }
            _ => None,
        };
        let mise = match &self.misefile {
            Some(p) if p.is_file() => {
                let txt = std::fs::read_to_string(p)
                    .with_context(|| format!("read {}", p.display()))?;
                Some(parse_mise_tools(&txt).with_context(|| format!("parse {}", p.display()))?)
            }
            _ => None,
        };
        Ok(DesiredState { brew, mise })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub brew: Option<BTreeSet<String>>,
    /// tool -> version
    pub mise: Option<BTreeMap<String, String>>,
}

pub fn parse_brewfile(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(|line| BREW_LINE.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// The `[tools]` table of a mise config. Values may be a version string, a
/// list (first entry wins) or a table with a `version` key.
pub fn parse_mise_tools(content: &str) -> Result<BTreeMap<String, String>> {
    let doc: toml::Table = toml::from_str(content)?;
    let mut tools = BTreeMap::new();
    let Some(table) = doc.get("tools").and_then(|t| t.as_table()) else {
        return Ok(tools);
    };
    for (name, value) in table {
        let version = match value {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Array(items) => items.first().and_then(|v| v.as_str()).map(String::from),
            toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()).map(String::from),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            _ => None,
        };
        match version {
            Some(v) => {
                tools.insert(name.clone(), v);
            }
            None => tracing::warn!(tool = %name, "skipping mise tool without a version"),
        }
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brewfile_keeps_only_formula_lines() {
        let txt = r#"
tap "homebrew/core"
brew "wget"
  brew "jq", restart_service: true
cask "firefox"
# brew "commented"
brew 'single'
"#;
        let names: Vec<_> = parse_brewfile(txt).into_iter().collect();
        assert_eq!(names, vec!["jq", "wget"]);
    }

    #[test]
    fn mise_tools_accept_common_shapes() {
        let txt = r#"
[env]
FOO = "bar"

[tools]
node = "20"
python = ["3.12", "3.11"]
go = { version = "1.22" }
"#;
        let tools = parse_mise_tools(txt).unwrap();
        assert_eq!(tools["node"], "20");
        assert_eq!(tools["python"], "3.12");
        assert_eq!(tools["go"], "1.22");
    }

    #[test]
    fn mise_without_tools_is_empty() {
        assert!(parse_mise_tools("[env]\nA = \"1\"\n").unwrap().is_empty());
        assert!(parse_mise_tools("not toml = = =").is_err());
    }

    #[test]
    fn sources_from_dir_detect_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Brewfile"), "brew \"wget\"\n").unwrap();
        std::fs::write(tmp.path().join(".mise.toml"), "[tools]\nnode = \"20\"\n").unwrap();
        let src = DesiredSources::from_dir(tmp.path());
        let desired = src.load().unwrap();
        assert!(desired.brew.unwrap().contains("wget"));
        assert_eq!(desired.mise.unwrap()["node"], "20");

        let empty = tempfile::tempdir().unwrap();
        let desired = DesiredSources::from_dir(empty.path()).load().unwrap();
        assert_eq!(desired, DesiredState::default());
    }
}
