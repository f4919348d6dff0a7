//! Command-line definition for `forge-check`.

use clap::{Args, Parser, Subcommand};
use forge_core::ReportFormat;
use std::path::PathBuf;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "forge.toml";

/// Validate generated server projects
#[derive(Debug, Parser)]
#[command(name = "forge-check", version, about)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the validation pipeline over one or more projects
    Validate(ValidateArgs),
    /// Write a default configuration file
    InitConfig {
        /// Destination of the configuration file
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file to check
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

/// Arguments of `forge-check validate`
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Project directories to validate
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Configuration file [default: ./forge.toml when present]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Validate projects concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Maximum number of concurrent pipelines
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Skip remaining projects after the first failure
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Keep running stages after a required stage failed
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Report format (json, text or html)
    #[arg(long)]
    pub format: Option<ReportFormat>,

    /// Directory for reports and diagnostics
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Do not write report files
    #[arg(long)]
    pub no_report: bool,
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validate_flags() {
        let cli = Cli::try_parse_from([
            "forge-check",
            "validate",
            "a",
            "b",
            "--parallel",
            "--workers",
            "3",
            "--format",
            "html",
        ])
        .unwrap();

        let Command::Validate(args) = cli.command else {
            panic!("expected validate");
        };
        assert_eq!(args.paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert!(args.parallel);
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.format, Some(ReportFormat::Html));
        assert!(!args.stop_on_failure);
    }

    #[test]
    fn test_validate_requires_a_path() {
        let parsed = Cli::try_parse_from(["forge-check", "validate"]);
        assert!(matches!(parsed, Err(_)));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let parsed = Cli::try_parse_from(["forge-check", "validate", "a", "--format", "pdf"]);
        assert!(matches!(parsed, Err(_)));
    }

    #[test]
    fn test_config_commands_default_path() {
        let cli = Cli::try_parse_from(["forge-check", "check-config"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::CheckConfig { ref path } if path == &PathBuf::from(DEFAULT_CONFIG_FILE)
        ));
    }
}
