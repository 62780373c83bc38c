use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::util::env_bool;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub allow: AllowConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Working-directory roots commands may run in; the first is the default cwd.
    #[serde(default)]
    pub workspaces: Vec<String>,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub system_repo: Option<SystemRepoConfig>,
    /// Hostname to profile label.
    #[serde(default)]
    pub profiles: BTreeMap<String, String>,
    #[serde(default)]
    pub slos: SloConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    /// State directory (markers, locks, repo cache). Defaults to the platform data dir.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Record confirmed package plans as applied without running them.
    #[serde(default)]
    pub inert: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct AllowConfig {
    /// Extra path roots (beyond `workspaces`) commands may use as cwd.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Allowed command basenames.
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
    /// Trusted directories searched, in order, to resolve commands.
    #[serde(default = "default_path_dirs", alias = "pathDirs")]
    pub path_dirs: Vec<String>,
    /// Extra environment pairs passed to every child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for AllowConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            commands: default_commands(),
            path_dirs: default_path_dirs(),
            env: BTreeMap::new(),
        }
    }
}

fn default_commands() -> Vec<String> {
    ["brew", "mise", "chezmoi", "git", "gopass"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_path_dirs() -> Vec<String> {
    ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LimitsConfig {
    #[serde(default = "default_rps")]
    pub default_rps: f64,
    #[serde(default = "read_only_rps")]
    pub read_only_rps: f64,
    #[serde(default = "pkg_admin_rps")]
    pub pkg_admin_rps: f64,
    #[serde(default = "secrets_rps")]
    pub secrets_rps: f64,
    /// Exact per-action overrides.
    #[serde(default)]
    pub per_action: BTreeMap<String, f64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_rps: default_rps(),
            read_only_rps: read_only_rps(),
            pkg_admin_rps: pkg_admin_rps(),
            secrets_rps: secrets_rps(),
            per_action: BTreeMap::new(),
        }
    }
}

fn default_rps() -> f64 {
    2.0
}
fn read_only_rps() -> f64 {
    5.0
}
fn pkg_admin_rps() -> f64 {
    0.2
}
fn secrets_rps() -> f64 {
    0.2
}

/// Capability class an action is rate limited under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    ReadOnly,
    PkgAdmin,
    Secrets,
    Default,
}

impl ActionClass {
    pub fn of(action: &str) -> Self {
        match action {
            "pkg_sync_apply" | "converge_host" | "system_converge" | "dotfiles_apply"
            | "pkg_rollback" => ActionClass::PkgAdmin,
            "secret_resolve" => ActionClass::Secrets,
            "pkg_sync_plan" | "system_plan" | "dotfiles_state" | "audit_info" => {
                ActionClass::ReadOnly
            }
            _ => ActionClass::Default,
        }
    }
}

impl LimitsConfig {
    /// Tokens per second for `action`: exact override, else its class rate.
    pub fn rate_for(&self, action: &str) -> f64 {
        if let Some(rps) = self.per_action.get(action) {
            return *rps;
        }
        match ActionClass::of(action) {
            ActionClass::ReadOnly => self.read_only_rps,
            ActionClass::PkgAdmin => self.pkg_admin_rps,
            ActionClass::Secrets => self.secrets_rps,
            ActionClass::Default => self.default_rps,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TimeoutsConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,
    /// Per-command-basename timeouts in milliseconds.
    #[serde(default = "default_per_command")]
    pub per_command: BTreeMap<String, u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            per_command: default_per_command(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_per_command() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("brew".to_string(), 300_000),
        ("mise".to_string(), 120_000),
        ("git".to_string(), 60_000),
    ])
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct AuditConfig {
    #[serde(default)]
    pub dir: Option<String>,
    /// "sqlite" (default), "sqlite_portable", or "jsonl".
    #[serde(default = "default_audit_kind")]
    pub kind: String,
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,
    #[serde(default = "default_true")]
    pub fallback_jsonl: bool,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_jsonl_max_bytes")]
    pub jsonl_max_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: None,
            kind: default_audit_kind(),
            retain_days: default_retain_days(),
            max_blob_bytes: default_max_blob_bytes(),
            fallback_jsonl: true,
            checkpoint_every: default_checkpoint_every(),
            jsonl_max_bytes: default_jsonl_max_bytes(),
        }
    }
}

fn default_audit_kind() -> String {
    "sqlite".into()
}
fn default_retain_days() -> u32 {
    30
}
fn default_max_blob_bytes() -> usize {
    262_144
}
fn default_true() -> bool {
    true
}
fn default_checkpoint_every() -> u64 {
    200
}
fn default_jsonl_max_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LocksConfig {
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            poll_ms: default_lock_poll_ms(),
        }
    }
}

fn default_lock_ttl_ms() -> u64 {
    10 * 60 * 1000
}
fn default_lock_poll_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct SecretsConfig {
    /// Glob-style roots (`team/*`) that secret references may point into.
    #[serde(default)]
    pub gopass_roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SystemRepoConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory inside the repo holding one subdirectory per profile.
    #[serde(default = "default_repo_root")]
    pub root: String,
    #[serde(default)]
    pub allow_https: bool,
    #[serde(default = "default_ssh_hosts")]
    pub ssh_allow_hosts: Vec<String>,
    #[serde(default = "default_cache_days")]
    pub cache_days: u32,
}

fn default_branch() -> String {
    "main".into()
}
fn default_repo_root() -> String {
    "hosts".into()
}
fn default_ssh_hosts() -> Vec<String> {
    ["github.com", "gitlab.com", "bitbucket.org"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_cache_days() -> u32 {
    14
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SloConfig {
    #[serde(default)]
    pub max_residual_pct_after_apply: f64,
    #[serde(default = "default_max_converge_ms")]
    pub max_converge_duration_ms: u64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_residual_pct_after_apply: 0.0,
            max_converge_duration_ms: default_max_converge_ms(),
        }
    }
}

fn default_max_converge_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct LogsConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// When set, also write a daily-rolling log file here.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config schema violation: {0}")]
    Schema(String),
    #[error("unknown audit kind `{0}`")]
    AuditKind(String),
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Schema(validation_errors.join(", ")).into());
    }
    let cfg: Config = toml::from_str(content)?;
    if hcv_kernel::BackendKind::parse(&cfg.audit.kind).is_none() {
        return Err(ConfigError::AuditKind(cfg.audit.kind).into());
    }
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut cfg = parse_config(&content).with_context(|| format!("parse {}", path.display()))?;
    cfg.apply_env_overrides();
    Ok(cfg)
}

/// Loads `path` when given, else `HCV_CONFIG`, else the platform config file
/// if it exists, else built-in defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    if let Some(p) = path {
        return load_config(p);
    }
    if let Ok(p) = std::env::var("HCV_CONFIG") {
        return load_config(Path::new(&p));
    }
    if let Some(p) = paths::default_config_file() {
        if p.is_file() {
            return load_config(&p);
        }
    }
    let mut cfg = Config::default();
    cfg.apply_env_overrides();
    Ok(cfg)
}

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("HCV_AUDIT_DIR") {
            if !dir.trim().is_empty() {
                self.audit.dir = Some(dir);
            }
        }
        if let Ok(kind) = std::env::var("HCV_AUDIT_KIND") {
            if hcv_kernel::BackendKind::parse(&kind).is_some() {
                self.audit.kind = kind;
            } else {
                tracing::warn!(kind = %kind, "ignoring unknown HCV_AUDIT_KIND");
            }
        }
        if let Some(flag) = env_bool("HCV_AUDIT_FALLBACK") {
            self.audit.fallback_jsonl = flag;
        }
        if let Some(flag) = env_bool("HCV_INERT") {
            self.inert = flag;
        }
        if let Ok(dir) = std::env::var("HCV_STATE_DIR") {
            if !dir.trim().is_empty() {
                self.state_dir = Some(dir);
            }
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_deref()
            .map(paths::expand_tilde)
            .unwrap_or_else(paths::default_data_dir)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.audit
            .dir
            .as_deref()
            .map(paths::expand_tilde)
            .unwrap_or_else(|| self.state_dir().join("audit"))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn repo_cache_dir(&self) -> PathBuf {
        self.state_dir().join("repo-cache")
    }

    pub fn workspace_paths(&self) -> Vec<PathBuf> {
        self.workspaces
            .iter()
            .map(|w| paths::expand_tilde(w))
            .collect()
    }

    /// Allowed cwd roots: workspaces followed by `allow.paths`.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.workspace_paths();
        roots.extend(self.allow.paths.iter().map(|p| paths::expand_tilde(p)));
        roots
    }

    pub fn audit_options(&self) -> hcv_kernel::AuditOptions {
        let mut opts = hcv_kernel::AuditOptions::new(self.audit_dir());
        opts.kind =
            hcv_kernel::BackendKind::parse(&self.audit.kind).unwrap_or(hcv_kernel::BackendKind::Sqlite);
        opts.max_blob_bytes = self.audit.max_blob_bytes;
        opts.fallback_jsonl = self.audit.fallback_jsonl;
        opts.checkpoint_every = self.audit.checkpoint_every;
        opts.jsonl_max_bytes = self.audit.jsonl_max_bytes;
        opts
    }

    /// Profile for `hostname`, falling back to `default`.
    pub fn profile_for(&self, hostname: &str) -> String {
        self.profiles
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HcvEnv;
    use serial_test::serial;

    #[test]
    fn defaults_fill_every_section() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.limits.default_rps, 2.0);
        assert_eq!(cfg.limits.pkg_admin_rps, 0.2);
        assert_eq!(cfg.timeouts.per_command.get("brew"), Some(&300_000));
        assert_eq!(cfg.audit.retain_days, 30);
        assert_eq!(cfg.audit.max_blob_bytes, 262_144);
        assert!(cfg.audit.fallback_jsonl);
        assert_eq!(cfg.locks.ttl_ms, 600_000);
        assert_eq!(cfg.slos.max_converge_duration_ms, 120_000);
        assert!(cfg.system_repo.is_none());
    }

    #[test]
    fn parses_full_document() {
        let cfg = parse_config(
            r#"
            workspaces = ["/srv/work"]

            [allow]
            commands = ["brew", "git"]
            pathDirs = ["/opt/homebrew/bin"]

            [limits]
            pkg_admin_rps = 1.0
            per_action = { pkg_sync_plan = 9.0 }

            [audit]
            kind = "jsonl"
            retain_days = 7

            [system_repo]
            url = "git@github.com:acme/hosts.git"

            [profiles]
            laptop = "work"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.allow.commands, vec!["brew", "git"]);
        assert_eq!(cfg.allow.path_dirs, vec!["/opt/homebrew/bin"]);
        assert_eq!(cfg.audit.kind, "jsonl");
        let repo = cfg.system_repo.as_ref().unwrap();
        assert_eq!(repo.branch, "main");
        assert_eq!(repo.root, "hosts");
        assert_eq!(repo.ssh_allow_hosts.len(), 3);
        assert_eq!(cfg.profile_for("laptop"), "work");
        assert_eq!(cfg.profile_for("other"), "default");
        assert_eq!(cfg.limits.rate_for("pkg_sync_plan"), 9.0);
        assert_eq!(cfg.limits.rate_for("pkg_sync_apply"), 1.0);
        assert_eq!(cfg.limits.rate_for("dotfiles_state"), 5.0);
        assert_eq!(cfg.limits.rate_for("something_else"), 2.0);
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = parse_config("workspaces = 3").unwrap_err();
        assert!(err.to_string().contains("schema"), "{err}");
    }

    #[test]
    fn unknown_audit_kind_is_rejected() {
        let err = parse_config("[audit]\nkind = \"postgres\"").unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        let env = HcvEnv::clean();
        env.set("HCV_AUDIT_DIR", "/tmp/hcv-audit")
            .set("HCV_AUDIT_KIND", "sqlite_portable")
            .set("HCV_AUDIT_FALLBACK", "off")
            .set("HCV_INERT", "yes");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.audit_dir(), PathBuf::from("/tmp/hcv-audit"));
        assert_eq!(
            cfg.audit_options().kind,
            hcv_kernel::BackendKind::SqlitePortable
        );
        assert!(!cfg.audit.fallback_jsonl);
        assert!(cfg.inert);
    }

    #[test]
    #[serial]
    fn unknown_audit_kind_in_env_is_ignored() {
        let env = HcvEnv::clean();
        env.set("HCV_AUDIT_KIND", "postgres").set("HCV_STATE_DIR", "  ");
        let mut cfg = parse_config("state_dir = \"/srv/hcv\"").unwrap();
        cfg.apply_env_overrides();
        assert_eq!(cfg.audit.kind, "sqlite");
        assert_eq!(cfg.state_dir(), PathBuf::from("/srv/hcv"));
        assert!(!cfg.inert);
    }

    #[test]
    #[serial]
    fn load_config_reads_file() {
        let _env = HcvEnv::clean();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "workspaces = [\"~/code\"]\n[audit]\nretain_days = 3\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.audit.retain_days, 3);
        assert!(!cfg.workspace_paths()[0].to_string_lossy().starts_with('~'));
    }

    #[test]
    fn schema_json_names_sections() {
        let schema = config_schema_json();
        let props = &schema["properties"];
        for key in ["allow", "limits", "timeouts", "audit", "locks", "slos"] {
            assert!(props.get(key).is_some(), "{key}");
        }
    }
}
