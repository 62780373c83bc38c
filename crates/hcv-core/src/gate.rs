//! Policy gate: the only place that spawns external processes.
//!
//! Every request is checked against the command allow-list, argument limits and
//! working-directory roots before anything runs. Children get a scrubbed
//! environment, no shell, a timeout and bounded output capture. `execute`
//! never fails; every outcome is encoded in [`ExecResult`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Config;
use crate::secrets::SecretResolver;

pub const CODE_OK: i32 = 0;
pub const CODE_EXEC_ERROR: i32 = 1;
pub const CODE_TIMEOUT: i32 = 124;
pub const CODE_POLICY_VIOLATION: i32 = 126;

pub const MAX_ARG_BYTES: usize = 8192;
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Bare command name (resolved through trusted dirs) or absolute path.
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Extra environment pairs for this call only.
    pub env: BTreeMap<String, String>,
    /// Additional directories searched after the trusted ones.
    pub path_extra: Vec<PathBuf>,
    /// Env var name to secret reference, resolved just before spawn.
    pub secret_refs: BTreeMap<String, String>,
}

impl ExecRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn path_extra(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_extra.push(dir.into());
        self
    }

    pub fn secret_ref(mut self, var: impl Into<String>, reference: impl Into<String>) -> Self {
        self.secret_refs.insert(var.into(), reference.into());
        self
    }

    /// The command's basename, used for timeouts and log fields.
    pub fn basename(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.program)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PolicyViolation,
    Timeout,
    ExecError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::Timeout => "timeout",
            FailureKind::ExecError => "exec_error",
        }
    }
}

impl ExecResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: CODE_OK,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn policy_violation(reason: impl AsRef<str>) -> Self {
        Self {
            code: CODE_POLICY_VIOLATION,
            stdout: String::new(),
            stderr: format!("policy_violation: {}", reason.as_ref()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            code: CODE_TIMEOUT,
            stdout: String::new(),
            stderr: "timeout".into(),
        }
    }

    pub fn exec_error(message: impl Into<String>) -> Self {
        Self {
            code: CODE_EXEC_ERROR,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.code {
            CODE_OK => None,
            CODE_POLICY_VIOLATION => Some(FailureKind::PolicyViolation),
            CODE_TIMEOUT => Some(FailureKind::Timeout),
            _ => Some(FailureKind::ExecError),
        }
    }
}

/// Anything that can run an [`ExecRequest`]. Planners and subsystems depend on
/// this rather than on [`PolicyGate`] directly.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, req: ExecRequest) -> ExecResult;
}

#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub allowed_commands: Vec<String>,
    pub trusted_dirs: Vec<PathBuf>,
    pub allowed_roots: Vec<PathBuf>,
    pub default_cwd: Option<PathBuf>,
    pub default_timeout: Duration,
    pub per_command_timeout: BTreeMap<String, Duration>,
    /// Pairs passed to every child in addition to PATH/LANG/LC_ALL.
    pub env_allow: BTreeMap<String, String>,
    pub max_output_bytes: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl GatePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            allowed_commands: cfg.allow.commands.clone(),
            trusted_dirs: cfg
                .allow
                .path_dirs
                .iter()
                .map(|d| crate::paths::expand_tilde(d))
                .collect(),
            allowed_roots: cfg.allowed_roots(),
            default_cwd: cfg.workspace_paths().into_iter().next(),
            default_timeout: Duration::from_millis(cfg.timeouts.default_ms),
            per_command_timeout: cfg
                .timeouts
                .per_command
                .iter()
                .map(|(k, ms)| (k.clone(), Duration::from_millis(*ms)))
                .collect(),
            env_allow: cfg.allow.env.clone(),
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    pub fn timeout_for(&self, basename: &str) -> Duration {
        self.per_command_timeout
            .get(basename)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

#[derive(Clone)]
pub struct PolicyGate {
    policy: Arc<GatePolicy>,
    secrets: Option<Arc<dyn SecretResolver>>,
}

impl PolicyGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            secrets: None,
        }
    }

    pub fn with_secrets(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(resolver);
        self
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// First hit per allowed name across the trusted dirs, in order.
    async fn allowed_binaries(&self) -> HashSet<PathBuf> {
        let mut out = HashSet::new();
        for name in &self.policy.allowed_commands {
            for dir in &self.policy.trusted_dirs {
                let full = dir.join(name);
                if is_file(&full).await {
                    out.insert(full);
                    break;
                }
            }
        }
        out
    }

    async fn resolve_candidate(&self, req: &ExecRequest) -> PathBuf {
        let requested = Path::new(&req.program);
        if requested.is_absolute() || req.program.contains('/') {
            return requested.to_path_buf();
        }
        for dir in self.policy.trusted_dirs.iter().chain(req.path_extra.iter()) {
            let full = dir.join(&req.program);
            if is_file(&full).await {
                return full;
            }
        }
        requested.to_path_buf()
    }

    async fn build_env(&self, req: &ExecRequest) -> Result<BTreeMap<String, String>, String> {
        let dirs: Vec<&PathBuf> = self
            .policy
            .trusted_dirs
            .iter()
            .chain(req.path_extra.iter())
            .collect();
        let path = std::env::join_paths(dirs).map_err(|e| format!("invalid PATH entry: {e}"))?;
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
        env.insert("LANG".to_string(), "C".to_string());
        env.insert("LC_ALL".to_string(), "C".to_string());
        for (k, v) in self.policy.env_allow.iter().chain(req.env.iter()) {
            env.insert(k.clone(), v.clone());
        }
        for (var, reference) in &req.secret_refs {
            match &self.secrets {
                Some(resolver) => {
                    if let Some(value) = resolver.resolve(reference).await {
                        env.insert(var.clone(), value);
                    } else {
                        tracing::warn!(var = %var, "secret reference did not resolve");
                    }
                }
                None => tracing::warn!(var = %var, "no secret resolver configured"),
            }
        }
        Ok(env)
    }

    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> ExecResult {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ExecResult::exec_error(err.to_string()),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = self.policy.max_output_bytes;

        let captured = tokio::time::timeout(timeout, async {
            tokio::try_join!(
                read_capped(stdout, max, "stdout"),
                read_capped(stderr, max, "stderr"),
                async { child.wait().await.map_err(CaptureError::Io) },
            )
        })
        .await;

        match captured {
            Err(_elapsed) => {
                let _ = child.kill().await;
                ExecResult::timeout()
            }
            Ok(Err(err)) => {
                let _ = child.kill().await;
                ExecResult::exec_error(err.to_string())
            }
            Ok(Ok((out, err, status))) => ExecResult {
                code: status.code().unwrap_or(CODE_EXEC_ERROR),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            },
        }
    }
}

#[async_trait]
impl Executor for PolicyGate {
    async fn execute(&self, req: ExecRequest) -> ExecResult {
        if let Err(reason) = validate_args(&req.args) {
            tracing::warn!(command = req.basename(), reason, "rejected arguments");
            return ExecResult::policy_violation(reason);
        }

        let allowed = self.allowed_binaries().await;
        let candidate = self.resolve_candidate(&req).await;
        if !allowed.contains(&candidate) {
            tracing::warn!(command = req.basename(), "command not allowlisted");
            return ExecResult::policy_violation(format!(
                "command {} not allowlisted",
                req.basename()
            ));
        }

        let cwd = match req
            .cwd
            .clone()
            .or_else(|| self.policy.default_cwd.clone())
            .map(Ok)
            .unwrap_or_else(std::env::current_dir)
        {
            Ok(cwd) => cwd,
            Err(err) => return ExecResult::exec_error(format!("cwd unavailable: {err}")),
        };
        if !crate::paths::is_within(&self.policy.allowed_roots, &cwd) {
            tracing::warn!(command = req.basename(), cwd = %cwd.display(), "cwd outside allowed roots");
            return ExecResult::policy_violation("cwd not within allowed roots");
        }

        let env = match self.build_env(&req).await {
            Ok(env) => env,
            Err(reason) => return ExecResult::policy_violation(reason),
        };
        let basename = candidate
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let timeout = req
            .timeout
            .unwrap_or_else(|| self.policy.timeout_for(&basename));

        let started = Instant::now();
        let result = self.run(&candidate, &req.args, &cwd, &env, timeout).await;
        tracing::debug!(
            command = %basename,
            argc = req.args.len(),
            code = result.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exec finished"
        );
        result
    }
}

#[derive(Debug, thiserror::Error)]
enum CaptureError {
    #[error("output_overflow: {stream} exceeded {limit} bytes")]
    Overflow { stream: &'static str, limit: usize },
    #[error("io error: {0}")]
    Io(std::io::Error),
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
    stream: &'static str,
) -> Result<Vec<u8>, CaptureError> {
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(CaptureError::Io)?;
    if buf.len() > limit {
        return Err(CaptureError::Overflow { stream, limit });
    }
    Ok(buf)
}

fn validate_args(args: &[String]) -> Result<(), &'static str> {
    for arg in args {
        if arg.len() > MAX_ARG_BYTES {
            return Err("arg_too_large");
        }
        if arg
            .bytes()
            .any(|b| matches!(b, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F))
        {
            return Err("arg_control_char");
        }
    }
    Ok(())
}

async fn is_file(p: &Path) -> bool {
    tokio::fs::metadata(p)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
