use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod util;

use commands::{AuditCmd, ConfigCmd, ConvergeArgs, DotfilesCmd, SourceArgs, SystemConvergeArgs};

#[derive(Parser)]
#[command(name = "hcv", version, about = "Policy-gated host convergence")]
struct Cli {
    /// Config file (defaults to HCV_CONFIG, then the platform config file)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff desired package state against the host (no changes)
    Plan(SourceArgs),
    /// Plan and, with --yes, apply packages then dotfiles
    Converge(ConvergeArgs),
    /// Converge from the configured system repository
    SystemConverge(SystemConvergeArgs),
    /// Print the inverse of the last applied package plan
    RollbackPlan,
    /// Dotfiles state and apply
    Dotfiles {
        #[command(subcommand)]
        cmd: DotfilesCmd,
    },
    /// Remove system repository checkouts past their retention
    PruneCache,
    /// Audit store maintenance
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Schema output needs no config and no logging.
    if let Commands::Config {
        cmd: ConfigCmd::Schema,
    } = &cli.command
    {
        return commands::config::schema(cli.pretty);
    }

    let cfg = hcv_core::resolve_config(cli.config.as_deref())?;
    hcv_log::init(&cfg.logs);
    let out = util::Output { pretty: cli.pretty };

    match cli.command {
        Commands::Plan(args) => commands::converge::plan(&cfg, &out, args).await,
        Commands::Converge(args) => commands::converge::converge(&cfg, &out, args).await,
        Commands::SystemConverge(args) => {
            commands::converge::system_converge(&cfg, &out, args).await
        }
        Commands::RollbackPlan => commands::converge::rollback_plan(&cfg, &out).await,
        Commands::Dotfiles { cmd } => commands::converge::dotfiles(&cfg, &out, cmd).await,
        Commands::PruneCache => commands::converge::prune_cache(&cfg, &out),
        Commands::Audit { cmd } => commands::audit::execute(&cfg, &out, cmd).await,
        Commands::Config { cmd } => commands::config::execute(&cfg, &out, cmd),
    }
}
