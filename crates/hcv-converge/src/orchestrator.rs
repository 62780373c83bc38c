//! Plan, confirm, apply and verify, as one cancellable run.
//!
//! A run passes through fixed phase boundaries. The deadline is checked only
//! at those boundaries: a mutating phase that has started always runs to
//! completion, and nothing already applied is rolled back. Package changes
//! are applied before dotfiles, and dotfiles are never touched when the
//! package residual is nonzero.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use hcv_core::config::{LimitsConfig, SloConfig};
use hcv_core::{
    Config, Executor, GatePolicy, GopassResolver, LockError, LockManager, LockOptions, PolicyGate,
    RateLimiter,
};
use hcv_events::Bus;
use hcv_kernel::{AuditEntry, ProvenanceStore};

use crate::context::RunContext;
use crate::desired::DesiredSources;
use crate::dotfiles::{Dotfiles, DotfilesOutcome, DotfilesState};
use crate::events::{
    AuditIds, ConvergeAborted, ConvergeApplied, ConvergePlanned, DotfilesApplied, PkgSyncRetry,
    PlannedCounts, RepoSynced, ResidualCounts, SloBreach,
};
use crate::managers::InventoryError;
use crate::pkg::{residual_total, ApplyOutcome, PkgSync, PlanOutcome};
use crate::plan::{Plan, Subsystem};
use crate::repo::{prune_repo_cache, PolicyCheck, RepoError, RepoSync, SyncOutcome};
use crate::slo;

pub const LOCK_PKG: &str = "pkg";
pub const LOCK_DOTFILES: &str = "dotfiles";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    RateLimited,
    LockBusy,
    LockFailed,
    PlanFailed,
    RepoSyncFailed,
    SignatureUnverified,
    PolicyFailed,
    PkgApplyFailed,
    DotfilesApplyFailed,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Cancelled => "cancelled",
            AbortReason::RateLimited => "rate_limited",
            AbortReason::LockBusy => "lock_busy",
            AbortReason::LockFailed => "lock_failed",
            AbortReason::PlanFailed => "plan_failed",
            AbortReason::RepoSyncFailed => "repo_sync_failed",
            AbortReason::SignatureUnverified => "signature_unverified",
            AbortReason::PolicyFailed => "policy_failed",
            AbortReason::PkgApplyFailed => "pkg_apply_failed",
            AbortReason::DotfilesApplyFailed => "dotfiles_apply_failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("rate_limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("desired state: {0:#}")]
    Desired(anyhow::Error),
}

impl ConvergeError {
    pub fn reason(&self) -> AbortReason {
        match self {
            ConvergeError::RateLimited { .. } => AbortReason::RateLimited,
            ConvergeError::Lock(LockError::Busy { .. }) => AbortReason::LockBusy,
            ConvergeError::Lock(_) => AbortReason::LockFailed,
            ConvergeError::Inventory(_) | ConvergeError::Desired(_) => AbortReason::PlanFailed,
            ConvergeError::Repo(_) => AbortReason::RepoSyncFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planned,
    Applied,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub summary: String,
    pub plan_sha: String,
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize)]
pub struct DotfilesStateStep {
    pub notes: usize,
    pub changes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PkgApplyStep {
    pub ok: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
    pub residual: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DotfilesApplyStep {
    pub ok: bool,
    pub changes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Steps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_sync: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_validate: Option<PolicyCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotfiles_state: Option<DotfilesStateStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg_apply: Option<PkgApplyStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotfiles_apply: Option<DotfilesApplyStep>,
}

/// Outcome of one run. Always complete, whether planned, applied or aborted.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeResult {
    pub run_id: String,
    pub profile: String,
    pub status: RunStatus,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AbortReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub steps: Steps,
}

impl ConvergeResult {
    pub fn ok(&self) -> bool {
        self.status == RunStatus::Applied
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvergeRequest {
    pub sources: DesiredSources,
    pub confirm: bool,
    /// Deadline measured from the start of the run.
    pub cancel_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SystemConvergeRequest {
    pub profile: Option<String>,
    pub host: Option<String>,
    pub git_ref: Option<String>,
    pub confirm: bool,
    pub verify_sig: bool,
    pub cancel_after: Option<Duration>,
}

impl Default for SystemConvergeRequest {
    fn default() -> Self {
        Self {
            profile: None,
            host: None,
            git_ref: None,
            confirm: false,
            verify_sig: true,
            cancel_after: None,
        }
    }
}

/// Mutable state of a run in progress.
struct Run {
    ctx: RunContext,
    tool: &'static str,
    steps: Steps,
    commit: Option<String>,
    audit_ids: AuditIds,
}

impl Run {
    fn new(ctx: RunContext, tool: &'static str) -> Self {
        Self {
            ctx,
            tool,
            steps: Steps::default(),
            commit: None,
            audit_ids: AuditIds::default(),
        }
    }

    fn finish(self, status: RunStatus, summary: impl Into<String>) -> ConvergeResult {
        ConvergeResult {
            run_id: self.ctx.run_id,
            profile: self.ctx.profile,
            status,
            aborted: status == RunStatus::Aborted,
            reason: None,
            retry_after_ms: None,
            error: None,
            summary: summary.into(),
            commit: self.commit,
            steps: self.steps,
        }
    }
}

pub struct Converger {
    exec: Arc<dyn Executor>,
    pkg: PkgSync,
    dotfiles: Dotfiles,
    repo: Option<RepoSync>,
    locks: Arc<LockManager>,
    limiter: Arc<RateLimiter>,
    audit: ProvenanceStore,
    bus: Bus,
    limits: LimitsConfig,
    slos: SloConfig,
    profiles: BTreeMap<String, String>,
    lock_opts: LockOptions,
}

impl Converger {
    /// Wires every collaborator from `cfg`, with `exec` as the only path to
    /// external commands.
    pub fn new(cfg: &Config, exec: Arc<dyn Executor>, audit: ProvenanceStore, bus: Bus) -> Self {
        let pkg = PkgSync::new(exec.clone(), cfg.state_dir().join("state"))
            .with_audit(audit.clone())
            .with_bus(bus.clone())
            .with_inert(cfg.inert);
        let repo = cfg
            .system_repo
            .clone()
            .map(|r| RepoSync::new(exec.clone(), r, cfg.repo_cache_dir()));
        let locks = LockManager::from_config(cfg);
        Self {
            dotfiles: Dotfiles::new(exec.clone()),
            exec,
            pkg,
            repo,
            lock_opts: locks.defaults(),
            locks: Arc::new(locks),
            limiter: Arc::new(RateLimiter::new()),
            audit,
            bus,
            limits: cfg.limits.clone(),
            slos: cfg.slos.clone(),
            profiles: cfg.profiles.clone(),
        }
    }

    /// Production wiring: audit store, a [`PolicyGate`] built from `cfg` with
    /// gopass secret resolution, and the repo cache as an extra cwd root.
    pub fn open(cfg: &Config, bus: Bus) -> Self {
        let audit = ProvenanceStore::open(cfg.audit_options()).with_bus(bus.clone());
        let limiter = Arc::new(RateLimiter::new());
        let mut policy = GatePolicy::from_config(cfg);
        policy.allowed_roots.push(cfg.repo_cache_dir());
        let plain: Arc<dyn Executor> = Arc::new(PolicyGate::new(policy.clone()));
        let resolver = GopassResolver::new(plain, cfg.secrets.gopass_roots.clone())
            .with_audit(audit.clone())
            .with_limiter(limiter.clone(), cfg.limits.rate_for("secret_resolve"))
            .with_bus(bus.clone());
        let gate = PolicyGate::new(policy).with_secrets(Arc::new(resolver));
        Self::new(cfg, Arc::new(gate), audit, bus).with_limiter(limiter)
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.lock_opts = locks.defaults();
        self.locks = locks;
        self
    }

    pub fn audit(&self) -> &ProvenanceStore {
        &self.audit
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.exec.clone()
    }

    fn admit(&self, action: &str) -> Result<(), ConvergeError> {
        let admission = self.limiter.allow(action, self.limits.rate_for(action));
        if admission.ok {
            Ok(())
        } else {
            tracing::warn!(action, retry_after_ms = ?admission.retry_after_ms, "rate limited");
            Err(ConvergeError::RateLimited {
                retry_after_ms: admission.retry_after_ms,
            })
        }
    }

    pub fn profile_for(&self, host: &str) -> String {
        self.profiles
            .get(host)
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Diff of desired against live package state. No side effects.
    pub async fn plan(&self, sources: &DesiredSources) -> Result<PlanOutcome, ConvergeError> {
        self.admit("pkg_sync_plan")?;
        let desired = sources.load().map_err(ConvergeError::Desired)?;
        Ok(self.pkg.plan(&desired).await?)
    }

    /// Applies an already-computed plan under the package lock.
    pub async fn apply(&self, plan: &Plan, confirm: bool) -> Result<ApplyOutcome, ConvergeError> {
        if !confirm {
            return Ok(self.pkg.apply(plan, false, None).await);
        }
        self.admit("pkg_sync_apply")?;
        let out = self
            .locks
            .with_lock(LOCK_PKG, self.lock_opts, || self.pkg.apply(plan, true, None))
            .await?;
        Ok(out)
    }

    pub async fn dotfiles_state(&self) -> Result<DotfilesState, ConvergeError> {
        self.admit("dotfiles_state")?;
        Ok(self.dotfiles.state().await)
    }

    /// Dry run, then with `confirm` the real apply under the dotfiles lock.
    pub async fn dotfiles_apply(&self, confirm: bool) -> Result<DotfilesOutcome, ConvergeError> {
        if !confirm {
            return Ok(self.dotfiles.apply(false).await);
        }
        self.admit("dotfiles_apply")?;
        let started = std::time::Instant::now();
        let out = self
            .locks
            .with_lock(LOCK_DOTFILES, self.lock_opts, || self.dotfiles.apply(true))
            .await?;
        let receipt = self
            .audit
            .record_async(
                AuditEntry::new("dotfiles_apply", json!({ "confirm": true }))
                    .ok(out.ok)
                    .output(out.dry_run.clone(), "")
                    .summary(out.summary.clone())
                    .latency(started.elapsed()),
            )
            .await;
        self.bus.publish(
            hcv_topics::TOPIC_DOTFILES_APPLIED,
            &DotfilesApplied {
                ok: out.ok,
                changes: out.changes,
                audit_id: Some(receipt.id),
                run_id: None,
            },
        );
        Ok(out)
    }

    /// Inverse of the last applied package plan.
    pub async fn rollback_plan(&self) -> Option<Plan> {
        self.pkg.rollback_plan().await
    }

    /// Removes repo cache entries older than the configured retention.
    pub fn prune_repo_cache(&self) -> std::io::Result<usize> {
        match &self.repo {
            Some(repo) => prune_repo_cache(repo.cache_dir(), repo.config().cache_days),
            None => Ok(0),
        }
    }

    /// Local convergence from explicit desired-state files.
    pub async fn converge_host(&self, req: ConvergeRequest) -> ConvergeResult {
        let ctx = RunContext::new("local").cancel_after(req.cancel_after);
        let span = ctx.span();
        let run = Run::new(ctx, "converge_host");
        async move {
            let action = if req.confirm { "converge_host" } else { "pkg_sync_plan" };
            if let Err(err) = self.admit(action) {
                return self.abort_with(run, "admission", &err);
            }
            self.pipeline(run, &req.sources, req.confirm).await
        }
        .instrument(span)
        .await
    }

    /// Convergence from the system repository: sync, verify the commit
    /// signature, then plan from the profile directory of the checkout.
    pub async fn system_converge(&self, req: SystemConvergeRequest) -> ConvergeResult {
        let host = req.host.clone().unwrap_or_else(local_hostname);
        let profile = req.profile.clone().unwrap_or_else(|| self.profile_for(&host));
        let ctx = RunContext::new(profile.clone()).cancel_after(req.cancel_after);
        let span = ctx.span();
        let mut run = Run::new(ctx, "system_converge");
        async move {
            let action = if req.confirm { "system_converge" } else { "system_plan" };
            if let Err(err) = self.admit(action) {
                return self.abort_with(run, "admission", &err);
            }
            let Some(repo) = &self.repo else {
                return self.abort_with(run, "repo", &ConvergeError::Repo(RepoError::NotConfigured));
            };
            if run.ctx.cancelled() {
                return self.abort(run, AbortReason::Cancelled, "pre-repo", None);
            }
            let synced = match repo.sync(req.git_ref.as_deref(), req.verify_sig).await {
                Ok(s) => s,
                Err(err) => return self.abort_with(run, "repo", &ConvergeError::Repo(err)),
            };
            self.bus.publish(
                hcv_topics::TOPIC_REPO_SYNCED,
                &RepoSynced {
                    commit: synced.commit.clone(),
                    verified_sig: synced.verified_sig,
                    run_id: run.ctx.run_id.clone(),
                },
            );
            run.commit = Some(synced.commit.clone());
            let verified = synced.verified_sig;
            run.steps.repo_sync = Some(synced);
            if req.verify_sig && !verified {
                return self.abort(run, AbortReason::SignatureUnverified, "repo", None);
            }
            let policy = match repo.validate_policies() {
                Ok(check) => check,
                Err(err) => return self.abort_with(run, "policy", &ConvergeError::Repo(err)),
            };
            let passed = policy.checks_passed;
            run.steps.policy_validate = Some(policy);
            if !passed {
                return self.abort(run, AbortReason::PolicyFailed, "policy", None);
            }
            let sources = match repo.profile_dir(&profile) {
                Ok(dir) => DesiredSources::from_dir(&dir),
                Err(err) => return self.abort_with(run, "plan", &ConvergeError::Repo(err)),
            };
            self.pipeline(run, &sources, req.confirm).await
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&self, mut run: Run, sources: &DesiredSources, confirm: bool) -> ConvergeResult {
        if run.ctx.cancelled() {
            return self.abort(run, AbortReason::Cancelled, "pre-plan", None);
        }
        let planned = match sources.load() {
            Ok(desired) => self.pkg.plan(&desired).await.map_err(ConvergeError::from),
            Err(err) => Err(ConvergeError::Desired(err)),
        };
        let planned = match planned {
            Ok(p) => p,
            Err(err) => return self.abort_with(run, "plan", &err),
        };
        run.steps.plan = Some(PlanStep {
            summary: planned.summary.clone(),
            plan_sha: planned.plan_sha.clone(),
            plan: planned.plan.clone(),
        });

        if run.ctx.cancelled() {
            return self.abort(run, AbortReason::Cancelled, "pre-dotfiles-state", None);
        }
        let dots = self.dotfiles.state().await;
        let dot_changes = dots.pending_changes();
        run.steps.dotfiles_state = Some(DotfilesStateStep {
            notes: dots.notes.len(),
            changes: dot_changes,
        });
        self.publish_planned(&run, &planned, dot_changes);

        if !confirm {
            tracing::info!("dry-run only");
            return run.finish(RunStatus::Planned, "Planned (dry-run)");
        }

        if run.ctx.cancelled() {
            return self.abort(run, AbortReason::Cancelled, "pre-pkg-apply", None);
        }
        let pkg = match self.apply_packages(&run, &planned.plan).await {
            Ok(out) => out,
            Err(err) => return self.abort_with(run, "pkg", &err),
        };
        let pkg_audit = self
            .record(
                &run,
                json!({"action": "pkg_sync_apply", "plan_sha": planned.plan_sha, "commit": run.commit}),
                pkg.outcome.ok,
                if pkg.outcome.ok { "applied" } else { "failed" },
            )
            .await;
        run.audit_ids.pkg = Some(pkg_audit.clone());
        run.steps.pkg_apply = Some(PkgApplyStep {
            ok: pkg.outcome.ok,
            attempts: pkg.attempts,
            audit_id: Some(pkg_audit),
            residual: pkg.outcome.residual.clone(),
            error_kind: pkg.outcome.error_kind.clone(),
        });
        let mut residual = ResidualCounts {
            brew: residual_total(&pkg.outcome.residual, Subsystem::Brew),
            mise: residual_total(&pkg.outcome.residual, Subsystem::Mise),
            dotfiles: 0,
        };
        if !pkg.outcome.ok {
            self.check_slos(&run, planned.plan.total(), residual.total());
            let kind = pkg.outcome.error_kind.clone();
            let mut result = self.abort(run, AbortReason::PkgApplyFailed, "pkg", kind);
            result.summary = "Aborted before dotfiles_apply due to package residuals".into();
            return result;
        }

        if run.ctx.cancelled() {
            return self.abort(run, AbortReason::Cancelled, "pre-dotfiles-apply", None);
        }
        let dout = match self
            .locks
            .with_lock(LOCK_DOTFILES, self.lock_opts, || self.dotfiles.apply(true))
            .await
        {
            Ok(out) => out,
            Err(err) => return self.abort_with(run, "dotfiles", &ConvergeError::Lock(err)),
        };
        let dot_audit = self
            .record(
                &run,
                json!({"action": "dotfiles_apply", "commit": run.commit}),
                dout.ok,
                &dout.summary,
            )
            .await;
        run.audit_ids.dotfiles = Some(dot_audit.clone());
        run.steps.dotfiles_apply = Some(DotfilesApplyStep {
            ok: dout.ok,
            changes: dout.changes,
            audit_id: Some(dot_audit.clone()),
        });
        self.bus.publish(
            hcv_topics::TOPIC_DOTFILES_APPLIED,
            &DotfilesApplied {
                ok: dout.ok,
                changes: dout.changes,
                audit_id: Some(dot_audit),
                run_id: Some(run.ctx.run_id.clone()),
            },
        );
        if !dout.ok {
            residual.dotfiles = dout.changes;
        }

        self.bus.publish(
            hcv_topics::TOPIC_CONVERGE_APPLIED,
            &ConvergeApplied {
                profile: run.ctx.profile.clone(),
                audit_ids: run.audit_ids.clone(),
                residual_counts: residual.clone(),
                ok: dout.ok,
                run_id: run.ctx.run_id.clone(),
            },
        );
        self.check_slos(&run, planned.plan.total() + dot_changes, residual.total());

        if !dout.ok {
            let kind = dout.error_kind.clone();
            return self.abort(run, AbortReason::DotfilesApplyFailed, "dotfiles", kind);
        }
        tracing::info!(elapsed_ms = run.ctx.elapsed().as_millis() as u64, "converged");
        run.finish(RunStatus::Applied, "Converged; no residuals")
    }

    /// Package apply under the package lock, retried once when the first
    /// attempt neither converged nor was a deliberate no-op.
    async fn apply_packages(&self, run: &Run, plan: &Plan) -> Result<PkgAttempt, ConvergeError> {
        let run_id = run.ctx.run_id.as_str();
        let first = self.locked_pkg_apply(plan, run_id).await?;
        if first.ok || first.inert {
            return Ok(PkgAttempt {
                outcome: first,
                attempts: 1,
            });
        }
        tracing::warn!(attempt = 1, error_kind = ?first.error_kind, "package apply failed, retrying");
        self.bus.publish(
            hcv_topics::TOPIC_PKG_SYNC_RETRY,
            &PkgSyncRetry {
                run_id: run.ctx.run_id.clone(),
                attempt: 1,
                error_kind: first.error_kind.clone(),
            },
        );
        let second = self.locked_pkg_apply(plan, run_id).await?;
        Ok(PkgAttempt {
            outcome: second,
            attempts: 2,
        })
    }

    async fn locked_pkg_apply(&self, plan: &Plan, run_id: &str) -> Result<ApplyOutcome, LockError> {
        self.locks
            .with_lock(LOCK_PKG, self.lock_opts, || self.pkg.apply(plan, true, Some(run_id)))
            .await
    }

    async fn record(&self, run: &Run, args: serde_json::Value, ok: bool, summary: &str) -> String {
        let entry = AuditEntry::new(run.tool, args)
            .ok(ok)
            .summary(summary)
            .latency(run.ctx.elapsed())
            .run_id(Some(&run.ctx.run_id));
        self.audit.record_async(entry).await.id
    }

    fn publish_planned(&self, run: &Run, planned: &PlanOutcome, dotfiles_changes: usize) {
        let brew = planned.plan.get(Subsystem::Brew).cloned().unwrap_or_default();
        let mise = planned.plan.get(Subsystem::Mise).cloned().unwrap_or_default();
        self.bus.publish(
            hcv_topics::TOPIC_CONVERGE_PLANNED,
            &ConvergePlanned {
                profile: run.ctx.profile.clone(),
                plan_sha: planned.plan_sha.clone(),
                run_id: run.ctx.run_id.clone(),
                counts: PlannedCounts {
                    brew_installs: brew.installs.len(),
                    brew_upgrades: brew.upgrades.len(),
                    mise_installs: mise.installs.len(),
                    dotfiles_changes,
                },
            },
        );
    }

    fn check_slos(&self, run: &Run, planned: usize, residual: usize) {
        for breach in slo::evaluate(&self.slos, planned, residual, run.ctx.elapsed()) {
            tracing::warn!(slo = breach.slo, value = breach.value, threshold = breach.threshold, "slo breach");
            self.bus.publish(
                hcv_topics::TOPIC_SLO_BREACH,
                &SloBreach {
                    slo: breach.slo.to_string(),
                    value: breach.value,
                    threshold: breach.threshold,
                    audit_ids: run.audit_ids.clone(),
                    run_id: run.ctx.run_id.clone(),
                },
            );
        }
    }

    fn abort_with(&self, run: Run, step: &str, err: &ConvergeError) -> ConvergeResult {
        let retry = match err {
            ConvergeError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        };
        let mut result = self.abort(run, err.reason(), step, None);
        result.error = Some(err.to_string());
        result.retry_after_ms = retry;
        result
    }

    fn abort(
        &self,
        run: Run,
        reason: AbortReason,
        step: &str,
        error_kind: Option<String>,
    ) -> ConvergeResult {
        tracing::warn!(reason = reason.as_str(), step, "converge aborted");
        self.bus.publish(
            hcv_topics::TOPIC_CONVERGE_ABORTED,
            &ConvergeAborted {
                reason: reason.as_str().to_string(),
                step: step.to_string(),
                error_kind,
                audit_ids: run.audit_ids.clone(),
                run_id: run.ctx.run_id.clone(),
            },
        );
        let summary = match reason {
            AbortReason::Cancelled => format!("Cancelled at {step}"),
            other => format!("Aborted: {}", other.as_str()),
        };
        let mut result = run.finish(RunStatus::Aborted, summary);
        result.reason = Some(reason);
        result
    }
}

struct PkgAttempt {
    outcome: ApplyOutcome,
    attempts: u32,
}

fn local_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
