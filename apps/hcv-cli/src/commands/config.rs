use anyhow::Result;
use clap::Subcommand;
use std::process::ExitCode;

use hcv_core::Config;

use crate::util::{render, Output};

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Emit the JSON Schema the config file is validated against
    Schema,
    /// Print the effective configuration after env overrides
    Show,
}

pub fn schema(pretty: bool) -> Result<ExitCode> {
    println!("{}", render(&hcv_core::config_schema_json(), pretty)?);
    Ok(ExitCode::SUCCESS)
}

pub fn execute(cfg: &Config, out: &Output, cmd: ConfigCmd) -> Result<ExitCode> {
    match cmd {
        ConfigCmd::Schema => schema(out.pretty),
        ConfigCmd::Show => {
            out.json(cfg)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
