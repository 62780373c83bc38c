//! Canonical event kinds published by the convergence engine.
//!
//! Downstream sinks key on these strings, so treat them as a stable contract.
//! Keep this list alphabetized within sections and favor dot.case names.

/// Schema version stamped on every published payload.
pub const EVENT_VERSION: &str = "1";

// Host convergence
pub const TOPIC_CONVERGE_ABORTED: &str = "converge.aborted";
pub const TOPIC_CONVERGE_APPLIED: &str = "converge.applied";
pub const TOPIC_CONVERGE_PLANNED: &str = "converge.planned";

// Package sync
pub const TOPIC_PKG_SYNC_APPLIED: &str = "pkg.sync.applied";
pub const TOPIC_PKG_SYNC_FAILED: &str = "pkg.sync.failed";
pub const TOPIC_PKG_SYNC_PLANNED: &str = "pkg.sync.planned";
pub const TOPIC_PKG_SYNC_RETRY: &str = "pkg.sync.retry";

// Dotfiles
pub const TOPIC_DOTFILES_APPLIED: &str = "dotfiles.applied";

// System repository
pub const TOPIC_REPO_SYNCED: &str = "repo.synced";

// Service level objectives
pub const TOPIC_SLO_BREACH: &str = "slo.breach";

// Audit store
pub const TOPIC_AUDIT_FALLBACK: &str = "audit.fallback";
pub const TOPIC_AUDIT_RETAINED: &str = "audit.retained";

// Secrets
pub const TOPIC_SECRET_ACCESS: &str = "secret.access";
