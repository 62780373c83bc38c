use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use hcv_converge::{
    ConvergeRequest, ConvergeResult, Converger, DesiredSources, SystemConvergeRequest,
};
use hcv_core::Config;
use hcv_events::Bus;

use crate::util::Output;

#[derive(Args, Clone)]
pub struct SourceArgs {
    /// Directory holding Brewfile and mise.toml
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
    /// Brewfile path (overrides --dir)
    #[arg(long)]
    pub brewfile: Option<PathBuf>,
    /// mise.toml path (overrides --dir)
    #[arg(long)]
    pub misefile: Option<PathBuf>,
}

impl SourceArgs {
    fn sources(&self) -> DesiredSources {
        let mut sources = DesiredSources::from_dir(&self.dir);
        if let Some(p) = &self.brewfile {
            sources.brewfile = Some(p.clone());
        }
        if let Some(p) = &self.misefile {
            sources.misefile = Some(p.clone());
        }
        sources
    }
}

#[derive(Args, Clone)]
pub struct ConvergeArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Apply changes; without it the run only plans
    #[arg(long)]
    pub yes: bool,
    /// Abort when the run exceeds this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Clone)]
pub struct SystemConvergeArgs {
    /// Profile directory to use (defaults to the hostname mapping)
    #[arg(long)]
    pub profile: Option<String>,
    /// Hostname used for the profile mapping
    #[arg(long)]
    pub host: Option<String>,
    /// Branch, tag or commit to check out
    #[arg(long = "ref")]
    pub git_ref: Option<String>,
    /// Skip commit signature verification
    #[arg(long)]
    pub no_verify_sig: bool,
    #[arg(long)]
    pub yes: bool,
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
pub enum DotfilesCmd {
    /// chezmoi doctor, diff and data
    State,
    /// Dry run, then apply with --yes
    Apply {
        #[arg(long)]
        yes: bool,
    },
}

fn converger(cfg: &Config) -> Converger {
    Converger::open(cfg, Bus::new(256))
}

fn run_exit(result: &ConvergeResult) -> ExitCode {
    if result.aborted {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

pub async fn plan(cfg: &Config, out: &Output, args: SourceArgs) -> Result<ExitCode> {
    let conv = converger(cfg);
    let outcome = conv.plan(&args.sources()).await?;
    conv.audit().close()?;
    out.json(&outcome)?;
    Ok(ExitCode::SUCCESS)
}

pub async fn converge(cfg: &Config, out: &Output, args: ConvergeArgs) -> Result<ExitCode> {
    let req = ConvergeRequest {
        sources: args.source.sources(),
        confirm: args.yes,
        cancel_after: args.timeout_secs.map(Duration::from_secs),
    };
    let conv = converger(cfg);
    let result = conv.converge_host(req).await;
    conv.audit().close()?;
    out.json(&result)?;
    Ok(run_exit(&result))
}

pub async fn system_converge(
    cfg: &Config,
    out: &Output,
    args: SystemConvergeArgs,
) -> Result<ExitCode> {
    let req = SystemConvergeRequest {
        profile: args.profile,
        host: args.host,
        git_ref: args.git_ref,
        confirm: args.yes,
        verify_sig: !args.no_verify_sig,
        cancel_after: args.timeout_secs.map(Duration::from_secs),
    };
    let conv = converger(cfg);
    let result = conv.system_converge(req).await;
    conv.audit().close()?;
    out.json(&result)?;
    Ok(run_exit(&result))
}

pub async fn rollback_plan(cfg: &Config, out: &Output) -> Result<ExitCode> {
    match converger(cfg).rollback_plan().await {
        Some(plan) => out.json(&json!({
            "plan": plan,
            "plan_sha": plan.fingerprint(),
            "summary": plan.summary(),
        }))?,
        None => out.json(&json!({ "plan": null, "summary": "no applied plan recorded" }))?,
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn dotfiles(cfg: &Config, out: &Output, cmd: DotfilesCmd) -> Result<ExitCode> {
    let conv = converger(cfg);
    match cmd {
        DotfilesCmd::State => {
            let state = conv.dotfiles_state().await?;
            conv.audit().close()?;
            let pending = state.pending_changes();
            out.json(&json!({ "state": state, "pending_changes": pending }))?;
            Ok(ExitCode::SUCCESS)
        }
        DotfilesCmd::Apply { yes } => {
            let outcome = conv.dotfiles_apply(yes).await?;
            conv.audit().close()?;
            out.json(&outcome)?;
            Ok(if outcome.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
    }
}

pub fn prune_cache(cfg: &Config, out: &Output) -> Result<ExitCode> {
    let removed = converger(cfg).prune_repo_cache()?;
    out.json(&json!({ "removed": removed }))?;
    Ok(ExitCode::SUCCESS)
}
