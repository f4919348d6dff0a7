use super::{Validator, elapsed_ms, pattern};
use crate::source::{SourceFile, load_sources_blocking};
use crate::toolchain::run_command;
use async_trait::async_trait;
use forge_core::stage::LINTING;
use forge_core::{Config, Result, RunContext, ValidationResult};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

/// Unfinished-work markers left in generated code.
static MARKER: LazyLock<Regex> = LazyLock::new(|| pattern(r"\b(TODO|FIXME|XXX)\b"));

/// Style checks: the declared external linter, or built-in rules when none is declared.
pub struct LintValidator {
    config: Arc<Config>,
}

impl LintValidator {
    /// Create a lint validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    async fn run_external(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        let output = run_command(&self.config.toolchain.lint, project, ctx).await?;
        let mut result = ValidationResult::passed();

        for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
            result.push_warning(line);
        }
        if !output.success {
            let status = output
                .exit_code
                .map_or_else(|| "a signal".to_owned(), |code| format!("status {code}"));
            result.push_error(format!("lint: linter exited with {status}"));
        }
        Ok(result)
    }

    async fn run_builtin(&self, project: &Path) -> Result<ValidationResult> {
        let sources = load_sources_blocking(project, &self.config).await?;
        let mut result = ValidationResult::passed().with_files_checked(sources.len());
        for source in &sources {
            lint_file(source, self.config.toolchain.max_line_length, &mut result);
        }
        Ok(result)
    }
}

fn lint_file(source: &SourceFile, max_line_length: usize, result: &mut ValidationResult) {
    let name = source.display();
    for (index, line) in source.contents.lines().enumerate() {
        let number = index + 1;
        let length = line.chars().count();
        if length > max_line_length {
            result.push_warning(format!(
                "{name}:{number}: line is {length} characters (limit {max_line_length})"
            ));
        }
        if line.ends_with([' ', '\t']) {
            result.push_warning(format!("{name}:{number}: trailing whitespace"));
        }
        if let Some(marker) = MARKER.find(line) {
            result.push_warning(format!(
                "{name}:{number}: unresolved {} marker",
                marker.as_str()
            ));
        }
    }
    if !source.contents.is_empty() && !source.contents.ends_with('\n') {
        result.push_warning(format!("{name}: missing trailing newline"));
    }
}

#[async_trait]
impl Validator for LintValidator {
    fn name(&self) -> &str {
        LINTING
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        ctx.check()?;
        let start = Instant::now();

        let mut result = if self.config.toolchain.lint.is_empty() {
            self.run_builtin(project).await?
        } else {
            self.run_external(ctx, project).await?
        };

        let limit = self.config.toolchain.max_lint_warnings;
        if result.warnings.len() > limit {
            result.push_error(format!(
                "lint: {} warnings exceed the limit of {limit}",
                result.warnings.len()
            ));
        }

        Ok(result.with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use forge_core::CancelToken;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(10))
    }

    #[test]
    fn test_builtin_rules() {
        let source = SourceFile {
            relative: PathBuf::from("main.go"),
            contents: format!("package main \n// TODO: wire handlers\nvar x = \"{}\"", "a".repeat(130)),
        };
        let mut result = ValidationResult::passed();
        lint_file(&source, 120, &mut result);

        assert!(result.success);
        assert_eq!(
            result.warnings,
            vec![
                "main.go:1: trailing whitespace".to_owned(),
                "main.go:2: unresolved TODO marker".to_owned(),
                "main.go:3: line is 140 characters (limit 120)".to_owned(),
                "main.go: missing trailing newline".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_too_many_warnings_fail_the_stage() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("main.go"), "a \nb \nc \n")?;

        let mut config = Config::default();
        config.toolchain.max_lint_warnings = 2;
        let result = LintValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await?;

        assert!(!result.success);
        assert_eq!(result.errors, vec!["lint: 3 warnings exceed the limit of 2".to_owned()]);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_linter_exit_status_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = Config::default();
        config.toolchain.lint = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "echo 'main.go:3: exported function should have comment'; exit 1".to_owned(),
        ];

        let result = LintValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await?;

        assert!(!result.success);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.errors, vec!["lint: linter exited with status 1".to_owned()]);
        Ok(())
    }

    #[test]
    fn test_marker_pattern_compiles() {
        assert!(MARKER.is_match("// TODO: wire up"));
        assert!(!MARKER.is_match("// todos are fine"));
    }
}
