use super::{Validator, elapsed_ms, pattern};
use crate::source::collect_source_files_blocking;
use crate::toolchain::run_command;
use async_trait::async_trait;
use forge_core::stage::COMPILATION_VALIDATION;
use forge_core::{Config, Result, RunContext, ValidationResult};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

/// Lines of build output that report a compiler error.
///
/// Covers `file:line[:col]: message` locations, rustc/clang style `error:`
/// prefixes and common undefined-symbol or missing-package wording.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(^\s*[^\s:]+\.[a-z0-9]+:\d+(:\d+)?:\s)|(^\s*error(\[\w+\])?:)|(\bundefined:)|(\bcannot find\b)|(\bno required module provides package\b)|(\bcould not import\b)",
    )
});

/// Lines of build output that report a compiler warning.
static WARNING_LINE: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)^\s*warning(\[\w+\])?:"));

/// Errors kept per run; compilers can print thousands of cascading lines.
const MAX_REPORTED_ERRORS: usize = 50;

/// Runs the declared native build command in the project directory.
pub struct BuildValidator {
    config: Arc<Config>,
}

impl BuildValidator {
    /// Create a build validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Validator for BuildValidator {
    fn name(&self) -> &str {
        COMPILATION_VALIDATION
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        let start = Instant::now();
        let files_checked = collect_source_files_blocking(project, &self.config).await?.len();
        let output = run_command(&self.config.toolchain.build, project, ctx).await?;

        let mut result = ValidationResult::passed().with_files_checked(files_checked);

        for line in output.lines() {
            if WARNING_LINE.is_match(line) {
                result.push_warning(line.trim());
            } else if !output.success
                && ERROR_LINE.is_match(line)
                && result.errors.len() < MAX_REPORTED_ERRORS
            {
                result.push_error(line.trim());
            }
        }

        if !output.success && result.errors.is_empty() {
            let status = output
                .exit_code
                .map_or_else(|| "terminated by signal".to_owned(), |code| format!("exit status {code}"));
            result.push_error(format!("build failed: {status}"));
        }

        tracing::debug!(
            "Build of {} {} with {} errors in {}ms",
            project.display(),
            if result.success { "succeeded" } else { "failed" },
            result.errors.len(),
            output.duration_ms
        );

        Ok(result.with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(all(test, unix))]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use core::time::Duration;
    use forge_core::{CancelToken, Error};
    use std::fs;
    use tempfile::TempDir;

    fn validator(script: &str) -> BuildValidator {
        let mut config = Config::default();
        config.toolchain.build = vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()];
        BuildValidator::new(Arc::new(config))
    }

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_successful_build_passes() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("main.go"), "package main\n")?;

        let result = validator("echo ok").validate(&ctx(), dir.path()).await?;
        assert!(result.success);
        assert_eq!(result.files_checked, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_compiler_error_lines_are_collected() -> Result<()> {
        let dir = TempDir::new()?;
        let script = "echo '# demo' >&2; echo './main.go:5:2: undefined: Handler' >&2; exit 1";

        let result = validator(script).validate(&ctx(), dir.path()).await?;
        assert!(!result.success);
        assert_eq!(result.errors, vec!["./main.go:5:2: undefined: Handler".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unrecognized_failure_reports_exit_status() -> Result<()> {
        let dir = TempDir::new()?;

        let result = validator("echo boom; exit 4").validate(&ctx(), dir.path()).await?;
        assert_eq!(result.errors, vec!["build failed: exit status 4".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_warnings_do_not_fail_build() -> Result<()> {
        let dir = TempDir::new()?;

        let result = validator("echo 'warning: unused variable' >&2")
            .validate(&ctx(), dir.path())
            .await?;
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_execution_error() {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = Config::default();
        config.toolchain.build = vec!["forge-no-such-compiler".to_owned()];

        let outcome = BuildValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await;
        assert!(matches!(outcome, Err(Error::ToolchainMissing(_))));
    }

    #[test]
    fn test_builtin_patterns_compile() {
        assert!(ERROR_LINE.is_match("main.go:3:5: undefined: Foo"));
        assert!(WARNING_LINE.is_match("warning: unused variable"));
    }
}
