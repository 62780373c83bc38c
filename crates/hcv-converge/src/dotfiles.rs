//! Dotfiles through chezmoi. Locking is the caller's concern.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use hcv_core::{ExecRequest, Executor};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DotfilesState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<Value>,
    pub notes: Vec<String>,
}

impl DotfilesState {
    /// Files chezmoi would change, counted from the diff headers.
    pub fn pending_changes(&self) -> usize {
        self.diff.as_deref().map_or(0, count_diffs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DotfilesOutcome {
    pub ok: bool,
    pub applied: bool,
    /// Files the dry run reported as changing.
    pub changes: usize,
    pub summary: String,
    pub dry_run: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

pub fn count_diffs(out: &str) -> usize {
    out.lines().filter(|l| l.starts_with("diff ")).count()
}

pub struct Dotfiles {
    exec: Arc<dyn Executor>,
}

impl Dotfiles {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    pub async fn state(&self) -> DotfilesState {
        let mut notes = Vec::new();
        let doctor = self.exec.execute(ExecRequest::new("chezmoi", ["doctor"])).await;
        if !doctor.ok() {
            notes.push("chezmoi doctor failed or not installed".to_string());
        }
        let diff = self
            .exec
            .execute(ExecRequest::new("chezmoi", ["diff", "--no-pager"]))
            .await;
        if !diff.ok() {
            notes.push("chezmoi diff failed or not installed".to_string());
        }
        let data = self.exec.execute(ExecRequest::new("chezmoi", ["data"])).await;
        let facts = if data.ok() {
            Some(
                serde_json::from_str(&data.stdout)
                    .unwrap_or_else(|_| Value::String(data.stdout.trim().to_string())),
            )
        } else {
            notes.push("chezmoi data failed or not installed".to_string());
            None
        };
        let non_empty = |s: String| Some(s.trim().to_string()).filter(|t| !t.is_empty());
        DotfilesState {
            doctor: non_empty(doctor.stdout),
            diff: non_empty(diff.stdout),
            facts,
            notes,
        }
    }

    /// Dry run first for the change summary; the real apply only with `confirm`.
    pub async fn apply(&self, confirm: bool) -> DotfilesOutcome {
        let dry = self
            .exec
            .execute(ExecRequest::new("chezmoi", ["apply", "--dry-run", "--verbose"]))
            .await;
        let changes = count_diffs(&dry.stdout);
        if !dry.ok() || !confirm {
            return DotfilesOutcome {
                ok: dry.ok(),
                applied: false,
                changes,
                summary: "planned".into(),
                dry_run: dry.stdout.clone(),
                error_kind: dry.failure_kind().map(|k| k.as_str().to_string()),
            };
        }
        let run = self.exec.execute(ExecRequest::new("chezmoi", ["apply"])).await;
        if !run.ok() {
            tracing::warn!(code = run.code, "chezmoi apply failed");
        }
        DotfilesOutcome {
            ok: run.ok(),
            applied: run.ok(),
            changes,
            summary: if run.ok() { "applied" } else { "failed" }.into(),
            dry_run: dry.stdout,
            error_kind: run.failure_kind().map(|k| k.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hcv_core::ExecResult;
    use parking_lot::Mutex;

    struct Chezmoi {
        apply_code: i32,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for Chezmoi {
        async fn execute(&self, req: ExecRequest) -> ExecResult {
            let line = req.args.join(" ");
            self.calls.lock().push(line.clone());
            match line.as_str() {
                "apply --dry-run --verbose" => {
                    ExecResult::success("diff --git a/.zshrc b/.zshrc\n+x\ndiff --git a/.vimrc b/.vimrc\n")
                }
                "apply" if self.apply_code == 0 => ExecResult::success(""),
                "apply" => ExecResult::exec_error("boom"),
                "data" => ExecResult::success("{\"os\":\"darwin\"}"),
                "doctor" => ExecResult::success("ok\n"),
                _ => ExecResult::exec_error("unknown"),
            }
        }
    }

    fn fake(apply_code: i32) -> Arc<Chezmoi> {
        Arc::new(Chezmoi {
            apply_code,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn unconfirmed_apply_only_dry_runs() {
        let exec = fake(0);
        let out = Dotfiles::new(exec.clone()).apply(false).await;
        assert!(out.ok);
        assert!(!out.applied);
        assert_eq!(out.changes, 2);
        assert_eq!(*exec.calls.lock(), vec!["apply --dry-run --verbose"]);
    }

    #[tokio::test]
    async fn confirmed_apply_reports_failure_kind() {
        let out = Dotfiles::new(fake(1)).apply(true).await;
        assert!(!out.ok);
        assert_eq!(out.error_kind.as_deref(), Some("exec_error"));
        let out = Dotfiles::new(fake(0)).apply(true).await;
        assert!(out.ok && out.applied);
        assert_eq!(out.summary, "applied");
    }

    #[tokio::test]
    async fn state_collects_notes_for_failures() {
        let state = Dotfiles::new(fake(0)).state().await;
        assert_eq!(state.doctor.as_deref(), Some("ok"));
        assert_eq!(state.facts.as_ref().unwrap()["os"], "darwin");
        assert_eq!(state.notes, vec!["chezmoi diff failed or not installed"]);
        assert_eq!(state.pending_changes(), 0);
    }
}
