//! Payloads published on the event bus. Field names are a stable contract
//! with subscribers.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AuditIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotfiles: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PlannedCounts {
    pub brew_installs: usize,
    pub brew_upgrades: usize,
    pub mise_installs: usize,
    pub dotfiles_changes: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ResidualCounts {
    pub brew: usize,
    pub mise: usize,
    pub dotfiles: usize,
}

impl ResidualCounts {
    pub fn total(&self) -> usize {
        self.brew + self.mise + self.dotfiles
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergePlanned {
    pub profile: String,
    pub plan_sha: String,
    pub run_id: String,
    pub counts: PlannedCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergeApplied {
    pub profile: String,
    pub audit_ids: AuditIds,
    pub residual_counts: ResidualCounts,
    pub ok: bool,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergeAborted {
    pub reason: String,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub audit_ids: AuditIds,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PkgSyncPlanned {
    pub plan_sha: String,
    pub summary: String,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PkgSyncOutcome {
    pub plan_sha: String,
    pub inert: bool,
    pub ok: bool,
    pub residual_counts: BTreeMap<String, usize>,
    pub audit_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PkgSyncRetry {
    pub run_id: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DotfilesApplied {
    pub ok: bool,
    pub changes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoSynced {
    pub commit: String,
    pub verified_sig: bool,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloBreach {
    pub slo: String,
    pub value: f64,
    pub threshold: f64,
    pub audit_ids: AuditIds,
    pub run_id: String,
}
