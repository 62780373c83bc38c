use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use std::process::ExitCode;

use hcv_core::Config;
use hcv_kernel::ProvenanceStore;

use crate::util::Output;

#[derive(Subcommand)]
pub enum AuditCmd {
    /// Backend, directory, row count and last checkpoint
    Info,
    /// Most recent audit rows, newest first
    Recent(RecentArgs),
    /// Fold the WAL back into the database
    Checkpoint,
    /// Reclaim free pages
    Vacuum,
    /// Delete rows and unreferenced blobs older than the retention window
    Retain(RetainArgs),
}

#[derive(Args)]
pub struct RecentArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args)]
pub struct RetainArgs {
    /// Days to keep (defaults to audit.retain_days)
    #[arg(long)]
    pub days: Option<u32>,
}

pub async fn execute(cfg: &Config, out: &Output, cmd: AuditCmd) -> Result<ExitCode> {
    let store = ProvenanceStore::open(cfg.audit_options());
    match cmd {
        AuditCmd::Info => out.json(&store.info())?,
        AuditCmd::Recent(args) => out.json(&store.recent(args.limit)?)?,
        AuditCmd::Checkpoint => {
            store.checkpoint_async().await?;
            out.json(&store.info())?;
        }
        AuditCmd::Vacuum => {
            store.vacuum_async().await?;
            out.json(&json!({ "ok": true }))?;
        }
        AuditCmd::Retain(args) => {
            let days = args.days.unwrap_or(cfg.audit.retain_days);
            let stats = store.retain_async(days).await?;
            tracing::info!(days, calls = stats.calls_removed, "audit retention applied");
            out.json(&json!({ "retain_days": days, "removed": stats }))?;
        }
    }
    store.close()?;
    Ok(ExitCode::SUCCESS)
}
