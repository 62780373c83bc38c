//! Package convergence across every registered manager: plan, apply a
//! confirmed plan, verify the residual and keep a last-applied marker for
//! rollback planning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use hcv_core::Executor;
use hcv_events::Bus;
use hcv_kernel::{AuditEntry, ProvenanceStore};

use crate::desired::DesiredState;
use crate::events::{PkgSyncOutcome, PkgSyncPlanned};
use crate::managers::{Brew, InventoryError, Mise, OpFailure, PackageManager};
use crate::plan::{ChangeSet, Plan};

pub const MARKER_FILE: &str = "applied-plan.json";
/// Written instead of running commands when inert mode is on.
pub const INERT_STATE_FILE: &str = "inert-state.json";

#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub plan_sha: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// True iff the residual is empty in every subsystem.
    pub ok: bool,
    /// True when any mutating command was attempted.
    pub applied: bool,
    /// True when nothing was attempted on purpose: unconfirmed, empty plan or
    /// an already-converged repeat of the last applied plan.
    pub inert: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    pub plan_sha: String,
    pub residual: Plan,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<OpFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
}

impl ApplyOutcome {
    fn inert(plan_sha: String, residual: Plan, ok: bool) -> Self {
        Self {
            ok,
            applied: false,
            inert: true,
            duplicate: false,
            plan_sha,
            residual,
            failures: Vec::new(),
            error_kind: None,
            audit_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AppliedMarker {
    fingerprint: String,
    ts: String,
    plan: Plan,
}

pub struct PkgSync {
    managers: Vec<Arc<dyn PackageManager>>,
    state_dir: PathBuf,
    audit: Option<ProvenanceStore>,
    bus: Option<Bus>,
    inert: bool,
}

impl PkgSync {
    /// Brew and mise managers over `exec`; the marker lives in `state_dir`.
    pub fn new(exec: Arc<dyn Executor>, state_dir: impl Into<PathBuf>) -> Self {
        let managers: Vec<Arc<dyn PackageManager>> = vec![
            Arc::new(Brew::new(exec.clone())),
            Arc::new(Mise::new(exec)),
        ];
        Self::with_managers(managers, state_dir)
    }

    pub fn with_managers(
        managers: Vec<Arc<dyn PackageManager>>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            managers,
            state_dir: state_dir.into(),
            audit: None,
            bus: None,
            inert: false,
        }
    }

    pub fn with_audit(mut self, audit: ProvenanceStore) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Record confirmed plans as applied without running any manager command.
    pub fn with_inert(mut self, inert: bool) -> Self {
        self.inert = inert;
        self
    }

    pub fn marker_path(&self) -> PathBuf {
        self.state_dir.join(MARKER_FILE)
    }

    pub fn inert_state_path(&self) -> PathBuf {
        self.state_dir.join(INERT_STATE_FILE)
    }

    pub async fn plan(&self, desired: &DesiredState) -> Result<PlanOutcome, InventoryError> {
        let mut plan = Plan::new();
        for manager in &self.managers {
            if let Some(changes) = manager.plan(desired).await? {
                plan.set(manager.subsystem(), changes);
            }
        }
        // A recorded inert apply counts as converged.
        if self.inert && tokio::fs::try_exists(self.inert_state_path()).await.unwrap_or(false) {
            tracing::debug!("inert state recorded, clearing plan");
            plan = Plan::new();
        }
        let outcome = PlanOutcome {
            plan_sha: plan.fingerprint(),
            summary: plan.summary(),
            plan,
        };
        tracing::info!(plan_sha = %outcome.plan_sha, summary = %outcome.summary, "package plan");
        if let Some(bus) = &self.bus {
            bus.publish(
                hcv_topics::TOPIC_PKG_SYNC_PLANNED,
                &PkgSyncPlanned {
                    plan_sha: outcome.plan_sha.clone(),
                    summary: outcome.summary.clone(),
                    counts: outcome.plan.counts(),
                },
            );
        }
        Ok(outcome)
    }

    /// Applies `plan` when `confirm` is set, then re-queries inventory for the
    /// residual. Never fails: problems are reported through the outcome.
    pub async fn apply(&self, plan: &Plan, confirm: bool, run_id: Option<&str>) -> ApplyOutcome {
        let sha = plan.fingerprint();
        if !confirm {
            return ApplyOutcome::inert(sha, plan.clone(), false);
        }
        let started = Instant::now();
        if plan.is_empty() {
            let out = ApplyOutcome::inert(sha, Plan::new(), true);
            return self.finish(plan, out, started, run_id).await;
        }
        if self.inert {
            if let Err(err) = self.record_inert(plan, &sha).await {
                tracing::warn!("failed to record inert state: {err:#}");
            }
            tracing::info!(plan_sha = %sha, "inert mode, plan recorded without running commands");
            let out = ApplyOutcome::inert(sha, Plan::new(), true);
            return self.finish(plan, out, started, run_id).await;
        }

        if self.last_applied_fingerprint().await.as_deref() == Some(sha.as_str()) {
            let (residual, err) = self.residual(plan).await;
            if err.is_none() && residual.is_empty() {
                tracing::info!(plan_sha = %sha, "plan already applied and converged");
                let mut out = ApplyOutcome::inert(sha, residual, true);
                out.duplicate = true;
                return self.finish(plan, out, started, run_id).await;
            }
        }

        let mut failures = Vec::new();
        for manager in &self.managers {
            if let Some(changes) = plan.get(manager.subsystem()).filter(|c| !c.is_empty()) {
                failures.extend(manager.apply(changes).await);
            }
        }
        if let Err(err) = self.write_marker(plan, &sha).await {
            tracing::warn!("failed to write applied-plan marker: {err:#}");
        }

        let (residual, verify_err) = self.residual(plan).await;
        let ok = verify_err.is_none() && residual.is_empty();
        let error_kind = if ok {
            None
        } else if let Some(first) = failures.first() {
            Some(first.kind.as_str().to_string())
        } else if verify_err.is_some() {
            Some("inventory_error".to_string())
        } else {
            Some("residual_nonzero".to_string())
        };
        let out = ApplyOutcome {
            ok,
            applied: true,
            inert: false,
            duplicate: false,
            plan_sha: sha,
            residual,
            failures,
            error_kind,
            audit_id: None,
        };
        self.finish(plan, out, started, run_id).await
    }

    /// Residual per planned subsystem. An inventory failure counts the whole
    /// change-set as unmet.
    async fn residual(&self, plan: &Plan) -> (Plan, Option<InventoryError>) {
        let mut residual = Plan::new();
        let mut first_err = None;
        for manager in &self.managers {
            let sub = manager.subsystem();
            let Some(changes) = plan.get(sub) else {
                continue;
            };
            match manager.residual(changes).await {
                Ok(left) => residual.set(sub, left),
                Err(err) => {
                    tracing::warn!(subsystem = %sub, "residual check failed: {err}");
                    residual.set(sub, changes.clone());
                    first_err.get_or_insert(err);
                }
            }
        }
        (residual, first_err)
    }

    async fn finish(
        &self,
        plan: &Plan,
        mut out: ApplyOutcome,
        started: Instant,
        run_id: Option<&str>,
    ) -> ApplyOutcome {
        let summary = if out.duplicate {
            "duplicate"
        } else if out.inert && self.inert {
            "inert"
        } else if out.inert {
            "noop"
        } else if out.ok {
            "applied"
        } else {
            "failed"
        };
        if let Some(audit) = &self.audit {
            let stderr = out
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.command, f.stderr))
                .collect::<Vec<_>>()
                .join("\n");
            let entry = AuditEntry::new("pkg_sync_apply", json!({ "plan_sha": out.plan_sha }))
                .ok(out.ok)
                .output(plan.summary(), stderr)
                .summary(summary)
                .latency(started.elapsed())
                .run_id(run_id);
            out.audit_id = Some(audit.record_async(entry).await.id);
        }
        if let Some(bus) = &self.bus {
            let topic = if out.ok {
                hcv_topics::TOPIC_PKG_SYNC_APPLIED
            } else {
                hcv_topics::TOPIC_PKG_SYNC_FAILED
            };
            bus.publish(
                topic,
                &PkgSyncOutcome {
                    plan_sha: out.plan_sha.clone(),
                    inert: out.inert,
                    ok: out.ok,
                    residual_counts: out.residual.counts(),
                    audit_id: out.audit_id.clone().unwrap_or_default(),
                },
            );
        }
        out
    }

    async fn write_marker(&self, plan: &Plan, sha: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| format!("create {}", self.state_dir.display()))?;
        let marker = AppliedMarker {
            fingerprint: sha.to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
            plan: plan.clone(),
        };
        let body = serde_json::to_vec_pretty(&marker)?;
        write_atomic(&self.marker_path(), &body).await
    }

    async fn record_inert(&self, plan: &Plan, sha: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| format!("create {}", self.state_dir.display()))?;
        let state = json!({
            "plan_sha": sha,
            "ts": chrono::Utc::now().to_rfc3339(),
            "summary": plan.summary(),
        });
        write_atomic(&self.inert_state_path(), &serde_json::to_vec_pretty(&state)?).await?;
        self.write_marker(plan, sha).await
    }

    async fn read_marker(&self) -> Option<AppliedMarker> {
        let bytes = tokio::fs::read(self.marker_path()).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(err) => {
                tracing::warn!("ignoring unreadable applied-plan marker: {err}");
                None
            }
        }
    }

    pub async fn last_applied(&self) -> Option<Plan> {
        self.read_marker().await.map(|m| m.plan)
    }

    async fn last_applied_fingerprint(&self) -> Option<String> {
        self.read_marker().await.map(|m| m.fingerprint)
    }

    /// Inverse of the last applied plan, if one was recorded.
    pub async fn rollback_plan(&self) -> Option<Plan> {
        self.last_applied().await.map(|p| p.invert())
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {}", path.display()))?;
    Ok(())
}

/// Residual change-set helper for callers assembling their own reports.
pub fn residual_total(residual: &Plan, sub: crate::plan::Subsystem) -> usize {
    residual.get(sub).map_or(0, ChangeSet::total)
}
