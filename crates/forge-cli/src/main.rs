//! forge-check - validate generated server projects from the command line
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::print_stdout,
        clippy::print_stderr,
        reason = "Allow for tests"
    )
)]

use anyhow::Result;
use clap::Parser as _;
use cli::{Cli, Command};
use std::process::ExitCode;

mod cli;
mod handlers;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate(args) => {
            let config = handlers::load_validate_config(&args)?;
            handlers::init_logging(&config.reporting.log_level);
            if handlers::handle_validate(config, args).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::InitConfig { path, force } => {
            handlers::init_logging("info");
            handlers::handle_init_config(&path, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig { path } => {
            handlers::init_logging("info");
            handlers::handle_check_config(&path)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
