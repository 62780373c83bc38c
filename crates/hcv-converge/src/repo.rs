//! System repository sync: a shallow git checkout of the host-config repo in
//! the local cache, optionally signature-verified at HEAD.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hcv_core::config::SystemRepoConfig;
use hcv_core::{ExecRequest, ExecResult, Executor};

pub const LAST_SYNC_MARKER: &str = ".last_sync";
pub const POLICIES_DIR: &str = "policies";

static SSH_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:git@|ssh://[^@/]+@)([^/:]+)[:/]").expect("ssh url regex"));
static SAFE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("segment regex"));

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("system_repo not configured")]
    NotConfigured,
    #[error("invalid_repo_url")]
    InvalidUrl,
    #[error("invalid ref `{0}`")]
    InvalidRef(String),
    #[error("invalid profile `{0}`")]
    InvalidProfile(String),
    #[error("path_traversal")]
    PathTraversal,
    #[error("git {step} failed: {stderr}")]
    Git { step: &'static str, stderr: String },
    #[error("repo cache io: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts `git@host:org/repo.git` and `ssh://user@host/...` for allow-listed
/// hosts, and `https://` only when enabled.
pub fn validate_repo_url(url: &str, allow_https: bool, ssh_hosts: &[String]) -> Result<(), RepoError> {
    if url.starts_with("git@") || url.starts_with("ssh://") {
        let host = SSH_HOST
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if ssh_hosts.iter().any(|h| h == host) {
            return Ok(());
        }
        return Err(RepoError::InvalidUrl);
    }
    if url.starts_with("https://") && allow_https {
        return Ok(());
    }
    Err(RepoError::InvalidUrl)
}

/// Checkout directory name: last path segment without `.git`.
pub fn repo_name(url: &str) -> String {
    let tail = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    tail.strip_suffix(".git").unwrap_or(tail).to_string()
}

/// Refs are passed as git arguments; anything option-like is refused.
pub fn validate_ref(git_ref: &str) -> Result<(), RepoError> {
    let ok = !git_ref.is_empty()
        && !git_ref.starts_with('-')
        && !git_ref.contains("..")
        && git_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(RepoError::InvalidRef(git_ref.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub commit: String,
    pub verified_sig: bool,
    pub path: PathBuf,
    pub summary: String,
}

/// Result of checking the checkout's policy manifests.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyCheck {
    pub checks_passed: bool,
    pub violations: Vec<String>,
    /// Manifest paths relative to the checkout.
    pub files: Vec<String>,
}

pub struct RepoSync {
    exec: Arc<dyn Executor>,
    cfg: SystemRepoConfig,
    cache_dir: PathBuf,
}

impl RepoSync {
    pub fn new(exec: Arc<dyn Executor>, cfg: SystemRepoConfig, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            cfg,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn config(&self) -> &SystemRepoConfig {
        &self.cfg
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn checkout_path(&self) -> Result<PathBuf, RepoError> {
        let name = repo_name(&self.cfg.url);
        if !SAFE_SEGMENT.is_match(&name) || name == "." || name == ".." {
            return Err(RepoError::PathTraversal);
        }
        Ok(self.cache_dir.join(name))
    }

    /// `<checkout>/<root>/<profile>`, where desired-state files live.
    pub fn profile_dir(&self, profile: &str) -> Result<PathBuf, RepoError> {
        if !SAFE_SEGMENT.is_match(profile) || profile == "." || profile == ".." {
            return Err(RepoError::InvalidProfile(profile.to_string()));
        }
        let mut dir = self.checkout_path()?;
        for part in self.cfg.root.split('/').filter(|p| !p.is_empty()) {
            if part == ".." || part == "." {
                return Err(RepoError::PathTraversal);
            }
            dir.push(part);
        }
        Ok(dir.join(profile))
    }

    async fn git(
        &self,
        step: &'static str,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ExecResult, RepoError> {
        let res = self
            .exec
            .execute(
                ExecRequest::new("git", args.iter().copied())
                    .cwd(cwd)
                    .timeout(timeout),
            )
            .await;
        if res.ok() {
            Ok(res)
        } else {
            Err(RepoError::Git {
                step,
                stderr: res.stderr.trim().to_string(),
            })
        }
    }

    /// Clones on first use, then fetches and checks out `git_ref` when given.
    pub async fn sync(&self, git_ref: Option<&str>, verify_sig: bool) -> Result<SyncOutcome, RepoError> {
        validate_repo_url(&self.cfg.url, self.cfg.allow_https, &self.cfg.ssh_allow_hosts)?;
        if let Some(r) = git_ref {
            validate_ref(r)?;
        }
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let dest = self.checkout_path()?;
        let dest_str = dest.to_string_lossy().to_string();
        if !dest.exists() {
            tracing::info!(url = %self.cfg.url, branch = %self.cfg.branch, "cloning system repo");
            self.git(
                "clone",
                &[
                    "clone",
                    "--depth",
                    "50",
                    "-b",
                    self.cfg.branch.as_str(),
                    self.cfg.url.as_str(),
                    dest_str.as_str(),
                ],
                &self.cache_dir,
                Duration::from_secs(300),
            )
            .await?;
        }
        if let Some(r) = git_ref {
            self.git("fetch", &["fetch", "--depth", "50", "origin", r], &dest, Duration::from_secs(180))
                .await?;
            self.git("checkout", &["checkout", r], &dest, Duration::from_secs(60))
                .await?;
        }
        let rev = self
            .git("rev-parse", &["rev-parse", "HEAD"], &dest, Duration::from_secs(30))
            .await?;
        let commit = rev.stdout.trim().to_string();

        let verified_sig = if verify_sig {
            let v = self
                .exec
                .execute(
                    ExecRequest::new("git", ["verify-commit", "HEAD"])
                        .cwd(&dest)
                        .timeout(Duration::from_secs(10)),
                )
                .await;
            if !v.ok() {
                tracing::warn!(%commit, "commit signature did not verify");
            }
            v.ok()
        } else {
            false
        };

        self.check_layout(&dest);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        tokio::fs::write(dest.join(LAST_SYNC_MARKER), now_ms.to_string()).await?;

        Ok(SyncOutcome {
            summary: format!("synced {commit}"),
            commit,
            verified_sig,
            path: dest,
        })
    }

    /// The checkout must carry a `policies/` directory; its entries are listed
    /// for the run record.
    pub fn validate_policies(&self) -> Result<PolicyCheck, RepoError> {
        let dir = self.checkout_path()?.join(POLICIES_DIR);
        if !dir.is_dir() {
            return Ok(PolicyCheck {
                checks_passed: false,
                violations: vec!["no policies directory".to_string()],
                files: Vec::new(),
            });
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            files.push(format!("{POLICIES_DIR}/{name}"));
        }
        files.sort();
        Ok(PolicyCheck {
            checks_passed: true,
            violations: Vec::new(),
            files,
        })
    }

    fn check_layout(&self, dest: &Path) {
        let root = dest.join(&self.cfg.root);
        let has_profiles = std::fs::read_dir(&root)
            .map(|mut it| it.any(|e| e.map(|e| e.path().is_dir()).unwrap_or(false)))
            .unwrap_or(false);
        if !has_profiles {
            tracing::warn!(path = %root.display(), "system repo has no profile directories");
        }
    }
}

/// Removes cached checkouts whose last sync (or mtime, without a marker) is
/// older than `days`. Returns the number removed.
pub fn prune_repo_cache(cache_dir: &Path, days: u32) -> std::io::Result<usize> {
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(days) * 24 * 3600);
    let cutoff_ms = cutoff
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut pruned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let ts = std::fs::read_to_string(path.join(LAST_SYNC_MARKER))
            .ok()
            .and_then(|s| s.trim().parse::<u128>().ok())
            .unwrap_or(mtime_ms);
        if ts < cutoff_ms {
            std::fs::remove_dir_all(&path)?;
            tracing::info!(path = %path.display(), "pruned repo cache entry");
            pruned += 1;
        }
    }
    Ok(pruned)
}
