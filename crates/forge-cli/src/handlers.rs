//! Command handlers for CLI operations

use anyhow::{Context as _, Result, bail};
use forge_core::{BatchTestRequest, BatchTestResult, CancelToken, Config};
use forge_validation::{
    BatchRunner, DiagnosedBatch, Reporter, compute_metrics, diagnostics_path,
    save_diagnostic_report,
};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::ctrl_c;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::cli::{DEFAULT_CONFIG_FILE, ValidateArgs};

/// Install the stderr subscriber; `RUST_LOG` wins over the configured level.
pub fn init_logging(level: &str) {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .init();
}

/// Resolve the configuration for `validate` and apply command-line overrides.
///
/// # Errors
/// Returns an error if the config file cannot be loaded or the result is invalid.
pub fn load_validate_config(args: &ValidateArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            Config::load_from_file(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("Failed to load {DEFAULT_CONFIG_FILE}"))?
        }
        None => Config::default(),
    };

    if args.parallel {
        config.batch.parallel = true;
    }
    if let Some(workers) = args.workers {
        config.batch.max_concurrent_workers = workers;
    }
    if args.continue_on_failure {
        config.pipeline.continue_on_failure = true;
    }
    if let Some(format) = args.format {
        config.reporting.format = format;
    }
    if let Some(output) = &args.output {
        config.reporting.output_path.clone_from(output);
    }
    if args.no_report {
        config.reporting.generate_report = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Validate every project and write reports; returns whether all passed.
///
/// # Errors
/// Returns an error if the batch request is invalid.
pub async fn handle_validate(config: Config, args: ValidateArgs) -> Result<bool> {
    let config = Arc::new(config);
    let cancel = CancelToken::new();
    spawn_interrupt_handler(cancel.clone());

    let mut request = BatchTestRequest::new(args.paths)
        .with_parallel(config.batch.parallel)
        .with_stop_on_failure(args.stop_on_failure);
    if let Some(workers) = args.workers {
        request = request.with_max_workers(workers);
    }

    let diagnosed = BatchRunner::new(Arc::clone(&config))
        .run_batch_diagnosed(&cancel, &request)
        .await
        .context("Batch validation failed")?;

    print_summary(&diagnosed.batch);

    if config.reporting.generate_report {
        write_reports(&config, &diagnosed);
    }

    Ok(diagnosed.batch.all_passed())
}

fn spawn_interrupt_handler(cancel: CancelToken) {
    tokio::spawn(async move {
        if ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, canceling validation");
            cancel.cancel();
        }
    });
}

/// Write per-project reports, the batch report and the diagnostics made
/// for failures.
///
/// Write failures are logged and skipped.
fn write_reports(config: &Arc<Config>, diagnosed: &DiagnosedBatch) {
    let reporter = Reporter::new(Arc::clone(config));
    let batch = &diagnosed.batch;

    for result in &batch.results {
        match reporter.generate_report(result) {
            Ok(path) => tracing::info!("Wrote report {}", path.display()),
            Err(error) => tracing::warn!(
                "Failed to write report for {}: {error}",
                result.project_path.display()
            ),
        }
    }

    for report in &diagnosed.reports {
        let path = diagnostics_path(&config.reporting.output_path, report.test_id);
        if let Err(error) = save_diagnostic_report(report, &path) {
            tracing::warn!("Failed to write diagnostics {}: {error}", path.display());
        }
    }

    if batch.results.len() > 1 {
        match reporter.generate_batch_report(batch) {
            Ok(path) => tracing::info!("Wrote batch report {}", path.display()),
            Err(error) => tracing::warn!("Failed to write batch report: {error}"),
        }
    }
}

#[allow(clippy::print_stdout, reason = "Summary is the command's output")]
fn print_summary(batch: &BatchTestResult) {
    for result in &batch.results {
        let score = compute_metrics(result).overall_score;
        let verdict = if result.success { "PASSED" } else { "FAILED" };
        println!(
            "[{verdict}] {} (score {score:.1}, {}ms)",
            result.project_path.display(),
            result.duration_ms
        );
        for error in &result.errors {
            println!("    error: {error}");
        }
        for recommendation in &result.recommendations {
            println!("    -> {recommendation}");
        }
    }
    println!(
        "{} passed, {} failed, {} total",
        batch.completed_tests, batch.failed_tests, batch.total_servers
    );
}

/// Write a default configuration file.
///
/// # Errors
/// Returns an error if the file exists (without `force`) or cannot be written.
#[allow(clippy::print_stdout, reason = "Command output")]
pub fn handle_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Load and validate a configuration file.
///
/// # Errors
/// Returns an error if the file cannot be loaded or is invalid.
#[allow(clippy::print_stdout, reason = "Command output")]
pub fn handle_check_config(path: &Path) -> Result<()> {
    let config = Config::load_from_file(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    println!(
        "Configuration OK: {} (timeout {}s, {} workers, {} reports)",
        path.display(),
        config.pipeline.timeout_seconds,
        config.batch.max_concurrent_workers,
        config.reporting.format
    );
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use crate::cli::{Cli, Command};
    use forge_core::ReportFormat;
    use tempfile::TempDir;

    fn validate_args(extra: &[&str]) -> ValidateArgs {
        let mut argv = vec!["forge-check", "validate", "project"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Validate(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides_are_applied() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("custom.toml");
        Config::default().save_to_file(&config_path).unwrap();
        let config_arg = config_path.to_string_lossy().into_owned();

        let args = validate_args(&[
            "--config",
            &config_arg,
            "--parallel",
            "--workers",
            "7",
            "--format",
            "text",
            "--no-report",
        ]);
        let config = load_validate_config(&args).unwrap();

        assert!(config.batch.parallel);
        assert_eq!(config.batch.max_concurrent_workers, 7);
        assert_eq!(config.reporting.format, ReportFormat::Text);
        assert!(!config.reporting.generate_report);
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("custom.toml");
        Config::default().save_to_file(&config_path).unwrap();
        let config_arg = config_path.to_string_lossy().into_owned();

        let args = validate_args(&["--config", &config_arg, "--workers", "0"]);
        assert!(matches!(load_validate_config(&args), Err(_)));
    }

    #[tokio::test]
    async fn test_reports_include_diagnostics_of_failed_projects() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("reports");
        let mut config = Config::default();
        config.reporting.output_path.clone_from(&output);
        let config = Arc::new(config);

        let missing = dir.path().join("missing-project");
        let request = BatchTestRequest::new(vec![missing]);
        let diagnosed = BatchRunner::new(Arc::clone(&config))
            .run_batch_diagnosed(&CancelToken::new(), &request)
            .await
            .unwrap();
        assert_eq!(diagnosed.reports.len(), 1);

        write_reports(&config, &diagnosed);

        let test_id = diagnosed.reports[0].test_id;
        assert!(diagnostics_path(&output, test_id).is_file());
        assert!(output.join(format!("{test_id}.json")).is_file());
    }

    #[test]
    fn test_init_config_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forge.toml");
        handle_init_config(&path, false).unwrap();
        assert!(matches!(handle_init_config(&path, false), Err(_)));
        handle_init_config(&path, true).unwrap();
        handle_check_config(&path).unwrap();
    }
}
