use super::{Validator, elapsed_ms};
use crate::source::collect_source_files_blocking;
use async_trait::async_trait;
use forge_core::stage::PRE_VALIDATION;
use forge_core::{Config, Result, RunContext, ValidationResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Structural checks: the project directory exists, declares a build
/// descriptor and contains at least one source file.
pub struct PreValidator {
    config: Arc<Config>,
}

impl PreValidator {
    /// Create a pre-validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Validator for PreValidator {
    fn name(&self) -> &str {
        PRE_VALIDATION
    }

    fn supports_async(&self) -> bool {
        false
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        ctx.check()?;
        let start = Instant::now();

        if !project.exists() {
            return Ok(ValidationResult::failed(format!(
                "project directory does not exist: {}",
                project.display()
            ))
            .with_duration_ms(elapsed_ms(start)));
        }
        if !project.is_dir() {
            return Ok(ValidationResult::failed(format!(
                "project path is not a directory: {}",
                project.display()
            ))
            .with_duration_ms(elapsed_ms(start)));
        }

        let mut result = ValidationResult::passed();
        let descriptors = &self.config.toolchain.descriptor_files;
        if !descriptors.is_empty()
            && !descriptors
                .iter()
                .any(|descriptor| project.join(descriptor).is_file())
        {
            result.push_error(format!(
                "missing build descriptor (expected one of: {})",
                descriptors.join(", ")
            ));
        }

        let sources = collect_source_files_blocking(project, &self.config).await?;
        if sources.is_empty() {
            result.push_error(format!(
                "no source files found (extensions: {})",
                self.config.toolchain.source_extensions.join(", ")
            ));
        }

        tracing::debug!(
            "Pre-validation of {} found {} source files",
            project.display(),
            sources.len()
        );

        Ok(result
            .with_files_checked(sources.len())
            .with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use forge_core::CancelToken;
    use std::fs;
    use tempfile::TempDir;

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(5))
    }

    fn validator() -> PreValidator {
        PreValidator::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_complete_project_passes() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("go.mod"), "module demo\n")?;
        fs::write(dir.path().join("main.go"), "package main\n")?;

        let result = validator().validate(&ctx(), dir.path()).await?;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.files_checked, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory_is_domain_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let result = validator()
            .validate(&ctx(), &dir.path().join("absent"))
            .await?;
        assert!(!result.success);
        assert!(result.errors[0].contains("does not exist"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_descriptor_and_sources_are_reported() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("notes.txt"), "hello\n")?;

        let result = validator().validate(&ctx(), dir.path()).await?;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("go.mod"));
        Ok(())
    }
}
