//! Secret references of the form `secret://gopass/<path>`.
//!
//! Resolution is deny-by-default: a path must pass the shape checks and match
//! one of the configured gopass roots. Values are never logged or audited;
//! audit rows carry only a hash of the logical path.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gate::{ExecRequest, Executor};
use crate::ratelimit::RateLimiter;
use crate::util::{sha256_hex, wildcard_match};

pub const GOPASS_TIMEOUT: Duration = Duration::from_millis(2000);

static REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^secret://gopass/([A-Za-z0-9/_\-.*]+)$").expect("secret ref regex"));

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolved value, or `None` when the reference is refused or unresolvable.
    async fn resolve(&self, reference: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("malformed secret reference")]
    Malformed,
    #[error("secret path not permitted")]
    Denied,
    #[error("secret lookups rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("gopass exited with {code}")]
    Backend { code: i32 },
}

pub fn make_ref(path: &str) -> String {
    format!("secret://gopass/{path}")
}

/// Logical gopass path inside a well-formed reference.
pub fn parse_ref(reference: &str) -> Result<&str, SecretError> {
    REF_RE
        .captures(reference)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or(SecretError::Malformed)
}

pub fn path_permitted(path: &str, roots: &[String]) -> bool {
    if path.starts_with('/') || path.contains("..") || path.contains("//") {
        return false;
    }
    if path.contains(".git") || path.contains(".gpg-id") {
        return false;
    }
    roots.iter().any(|root| wildcard_match(root, path))
}

pub struct GopassResolver {
    exec: Arc<dyn Executor>,
    roots: Vec<String>,
    audit: Option<hcv_kernel::ProvenanceStore>,
    limiter: Option<(Arc<RateLimiter>, f64)>,
    bus: Option<hcv_events::Bus>,
}

impl GopassResolver {
    /// `exec` must not itself resolve secrets.
    pub fn new(exec: Arc<dyn Executor>, roots: Vec<String>) -> Self {
        Self {
            exec,
            roots,
            audit: None,
            limiter: None,
            bus: None,
        }
    }

    pub fn with_audit(mut self, audit: hcv_kernel::ProvenanceStore) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>, rate: f64) -> Self {
        self.limiter = Some((limiter, rate));
        self
    }

    pub fn with_bus(mut self, bus: hcv_events::Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn lookup(&self, reference: &str) -> Result<String, SecretError> {
        let logical = parse_ref(reference)?;
        let started = Instant::now();
        if let Some((limiter, rate)) = &self.limiter {
            let admission = limiter.allow("secret_resolve", *rate);
            if !admission.ok {
                return Err(SecretError::RateLimited {
                    retry_after_ms: admission.retry_after_ms,
                });
            }
        }
        if !path_permitted(logical, &self.roots) {
            self.record(logical, false, started).await;
            return Err(SecretError::Denied);
        }
        let res = self
            .exec
            .execute(ExecRequest::new("gopass", ["show", "-o", "--", logical]).timeout(GOPASS_TIMEOUT))
            .await;
        let ok = res.ok();
        self.record(logical, ok, started).await;
        if !ok {
            return Err(SecretError::Backend { code: res.code });
        }
        Ok(res.stdout.trim().to_string())
    }

    async fn record(&self, logical: &str, ok: bool, started: Instant) {
        let ref_hash = sha256_hex(logical.as_bytes());
        tracing::info!(ref_hash = %ref_hash, ok, "secret access");
        if let Some(bus) = &self.bus {
            bus.publish(
                hcv_topics::TOPIC_SECRET_ACCESS,
                &json!({"ref_hash": ref_hash, "ok": ok}),
            );
        }
        if let Some(audit) = &self.audit {
            let entry = hcv_kernel::AuditEntry::new(
                "secret_access",
                json!({"ref_hash": ref_hash, "tool": "resolve_secret_ref"}),
            )
            .ok(ok)
            .summary(if ok { "ok" } else { "err" })
            .latency(started.elapsed())
            .redacted();
            audit.record_async(entry).await;
        }
    }
}

#[async_trait]
impl SecretResolver for GopassResolver {
    async fn resolve(&self, reference: &str) -> Option<String> {
        match self.lookup(reference).await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!("secret reference unresolved: {err}");
                None
            }
        }
    }
}
