//! Ordered, stage-by-stage execution of validators over one project.

use crate::validator::{Validator, ValidatorRegistry, elapsed_ms};
use forge_core::{
    Config, Error, PipelineResult, PipelineState, Result, RunContext, StagePlan, StageResult,
    StageResults, StageSpec, ValidationResult,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::time::sleep;

/// Snapshot of a pipeline's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    /// Current state
    pub state: PipelineState,
    /// Whether an execution is in flight
    pub running: bool,
    /// Stages planned for the current or last run
    pub total_stages: usize,
    /// Stages that have recorded a result
    pub completed_stages: usize,
    /// Stage being executed, if any
    pub current_stage: Option<String>,
    /// Project of the current or last run
    pub project_path: Option<PathBuf>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            running: false,
            total_stages: 0,
            completed_stages: 0,
            current_stage: None,
            project_path: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    status: PipelineStatus,
    last_result: Option<PipelineResult>,
}

/// Resets the status if an execution is dropped before it finishes.
struct RunGuard<'pipeline> {
    shared: &'pipeline Mutex<Shared>,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut shared = lock(self.shared);
            shared.status.state = PipelineState::Canceled;
            shared.status.running = false;
            shared.status.current_stage = None;
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a run ended before the plan was exhausted.
enum Interruption {
    /// Canceled or out of time; reported as data
    Aborted(Error),
    /// A stage could not execute; returned as an error
    Failed(Error),
}

/// Runs the planned validators over a project and aggregates their results.
///
/// One instance executes one project at a time; a concurrent `execute`
/// is rejected with [`Error::Busy`].
pub struct TestPipeline {
    config: Arc<Config>,
    registry: ValidatorRegistry,
    plan: StagePlan,
    shared: Mutex<Shared>,
}

impl TestPipeline {
    /// Pipeline with the standard validators and the plan derived from `config`.
    pub fn new(config: Arc<Config>) -> Self {
        let registry = ValidatorRegistry::standard(&config);
        Self::with_registry(config, registry)
    }

    /// Pipeline with a custom registry and the plan derived from `config`.
    pub fn with_registry(config: Arc<Config>, registry: ValidatorRegistry) -> Self {
        let plan = StagePlan::from_config(&config);
        Self {
            config,
            registry,
            plan,
            shared: Mutex::new(Shared::default()),
        }
    }

    /// Append an extra stage and register its validator.
    #[must_use]
    pub fn with_stage(mut self, required: bool, validator: Arc<dyn Validator>) -> Self {
        self.plan.push(StageSpec::new(validator.name(), required));
        self.registry.register(validator);
        self
    }

    /// The stages this pipeline executes, in order.
    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Current progress; never waits for the run.
    pub fn status(&self) -> PipelineStatus {
        lock(&self.shared).status.clone()
    }

    /// Result of the most recent finished run, including runs that returned an error.
    pub fn last_result(&self) -> Option<PipelineResult> {
        lock(&self.shared).last_result.clone()
    }

    /// Validate the project at `project`.
    ///
    /// Domain failures, cancellation and the deadline are reported in the
    /// returned [`PipelineResult`].
    ///
    /// # Errors
    /// Returns [`Error::Busy`] when another execution is in flight, and the
    /// stage's execution error when a validator cannot run (after retries).
    pub async fn execute(&self, ctx: &RunContext, project: &Path) -> Result<PipelineResult> {
        self.begin(project)?;
        let mut guard = RunGuard {
            shared: &self.shared,
            finished: false,
        };

        tracing::info!(
            "Starting pipeline for {} with {} stages",
            project.display(),
            self.plan.len()
        );

        let (result, interruption) = self.run_stages(ctx, project).await;

        {
            let mut shared = lock(&self.shared);
            shared.status.state = result.state;
            shared.status.running = false;
            shared.status.current_stage = None;
            shared.status.completed_stages = result.completed_stages;
            shared.last_result = Some(result.clone());
        }
        guard.finished = true;

        tracing::info!(
            "Pipeline for {} finished: {} ({}/{} stages, {}ms)",
            project.display(),
            result.state,
            result.completed_stages,
            result.total_stages,
            result.duration_ms
        );

        match interruption {
            Some(Interruption::Failed(error)) => Err(error),
            Some(Interruption::Aborted(_)) | None => Ok(result),
        }
    }

    fn begin(&self, project: &Path) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.status.running {
            return Err(Error::Busy);
        }
        shared.status = PipelineStatus {
            state: PipelineState::Running,
            running: true,
            total_stages: self.plan.len(),
            completed_stages: 0,
            current_stage: None,
            project_path: Some(project.to_path_buf()),
        };
        Ok(())
    }

    fn set_progress(&self, current_stage: Option<&str>, completed_stages: usize) {
        let mut shared = lock(&self.shared);
        shared.status.current_stage = current_stage.map(str::to_owned);
        shared.status.completed_stages = completed_stages;
    }

    async fn run_stages(
        &self,
        ctx: &RunContext,
        project: &Path,
    ) -> (PipelineResult, Option<Interruption>) {
        let start = Instant::now();
        let mut stages = StageResults::default();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut success = true;
        let mut interruption = None;

        for spec in self.plan.stages() {
            if let Err(error) = ctx.check() {
                errors.push(error.to_string());
                interruption = Some(Interruption::Aborted(error));
                break;
            }
            self.set_progress(Some(&spec.name), stages.len());

            let Some(validator) = self.registry.get(&spec.name) else {
                let error = Error::UnknownStage(spec.name.clone());
                errors.push(error.to_string());
                stages.insert(StageResult::aborted(&spec.name, spec.required, error.to_string(), 0));
                interruption = Some(Interruption::Failed(error));
                break;
            };

            let stage_start = Instant::now();
            match self.run_with_retry(&validator, ctx, project).await {
                Ok(validation) => {
                    let duration_ms = elapsed_ms(stage_start);
                    let passed = validation.success;
                    tracing::debug!(
                        "Stage {} {} in {}ms",
                        spec.name,
                        if passed { "passed" } else { "failed" },
                        duration_ms
                    );

                    errors.extend(validation.errors.iter().cloned());
                    warnings.extend(validation.warnings.iter().cloned());
                    stages.insert(StageResult::from_validation(
                        &spec.name,
                        spec.required,
                        validation,
                        duration_ms,
                    ));

                    if !passed && spec.required {
                        success = false;
                        if !self.config.pipeline.continue_on_failure {
                            tracing::info!("Required stage {} failed, stopping", spec.name);
                            break;
                        }
                    }
                }
                Err(error) => {
                    let duration_ms = elapsed_ms(stage_start);
                    errors.push(error.to_string());
                    stages.insert(StageResult::aborted(
                        &spec.name,
                        spec.required,
                        error.to_string(),
                        duration_ms,
                    ));

                    interruption = Some(if error.is_cancellation() {
                        tracing::warn!("Stage {} interrupted: {error}", spec.name);
                        Interruption::Aborted(error)
                    } else {
                        tracing::warn!("Stage {} could not execute: {error}", spec.name);
                        Interruption::Failed(Error::StageExecution {
                            stage: spec.name.clone(),
                            message: error.to_string(),
                        })
                    });
                    break;
                }
            }
        }

        let state = match &interruption {
            Some(Interruption::Aborted(Error::Canceled)) => PipelineState::Canceled,
            Some(_) => PipelineState::Failed,
            None if success => PipelineState::Completed,
            None => PipelineState::Failed,
        };

        let result = PipelineResult {
            project_path: project.to_path_buf(),
            state,
            total_stages: self.plan.len(),
            completed_stages: stages.len(),
            success: success && interruption.is_none(),
            stages,
            errors,
            warnings,
            duration_ms: elapsed_ms(start),
        };
        (result, interruption)
    }

    async fn run_with_retry(
        &self,
        validator: &Arc<dyn Validator>,
        ctx: &RunContext,
        project: &Path,
    ) -> Result<ValidationResult> {
        let mut attempt = 0;
        loop {
            match run_validator(Arc::clone(validator), ctx, project).await {
                Err(error) if error.is_retryable() && attempt < self.config.retry.attempts => {
                    attempt += 1;
                    tracing::warn!(
                        "Stage {} failed with {error}, retrying ({attempt}/{})",
                        validator.name(),
                        self.config.retry.attempts
                    );
                    let delay = self.config.retry.delay();
                    ctx.guard(async {
                        sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                outcome => return outcome,
            }
        }
    }
}

/// Run one validator, on its own task when it is async-capable so that
/// cancellation can abort it.
async fn run_validator(
    validator: Arc<dyn Validator>,
    ctx: &RunContext,
    project: &Path,
) -> Result<ValidationResult> {
    if !validator.supports_async() {
        return ctx.guard(validator.validate(ctx, project)).await;
    }

    let task_ctx = ctx.clone();
    let task_project = project.to_path_buf();
    let mut handle =
        tokio::spawn(async move { validator.validate(&task_ctx, &task_project).await });

    let outcome = ctx
        .guard(async {
            match (&mut handle).await {
                Ok(outcome) => outcome,
                Err(err) => Err(Error::Other(format!("Validator task failed: {err}"))),
            }
        })
        .await;

    if outcome.is_err() {
        handle.abort();
    }
    outcome
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use core::time::Duration;
    use forge_core::CancelToken;
    use forge_core::stage::{COMPILATION_VALIDATION, PRE_VALIDATION, SYNTAX_VALIDATION};
    use std::io::{Error as IoError, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    enum Behavior {
        Pass,
        Fail,
        Sleep(Duration),
        FlakySpawn(AtomicU32),
        Broken,
    }

    struct Scripted {
        name: &'static str,
        behavior: Behavior,
    }

    impl Scripted {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self { name, behavior })
        }
    }

    #[async_trait]
    impl Validator for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn supports_async(&self) -> bool {
            matches!(self.behavior, Behavior::Sleep(_))
        }

        async fn validate(&self, _ctx: &RunContext, _project: &Path) -> Result<ValidationResult> {
            match &self.behavior {
                Behavior::Pass => Ok(ValidationResult::passed()),
                Behavior::Fail => Ok(ValidationResult::failed(format!("{} failed", self.name))),
                Behavior::Sleep(duration) => {
                    sleep(*duration).await;
                    Ok(ValidationResult::passed())
                }
                Behavior::FlakySpawn(failures_left) => {
                    if failures_left.load(Ordering::SeqCst) > 0 {
                        failures_left.fetch_sub(1, Ordering::SeqCst);
                        return Err(Error::Spawn {
                            program: "flaky".to_owned(),
                            source: IoError::new(ErrorKind::ResourceBusy, "busy"),
                        });
                    }
                    Ok(ValidationResult::passed())
                }
                Behavior::Broken => Err(Error::ToolchainMissing("go".to_owned())),
            }
        }
    }

    fn registry(validators: Vec<Arc<Scripted>>) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new();
        for validator in validators {
            registry.register(validator);
        }
        registry
    }

    fn base_config() -> Config {
        let mut config = Config::default();
        config.features.security_scanning = false;
        config.features.linting = false;
        config.retry.delay_ms = 1;
        config
    }

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(30))
    }

    fn pipeline(config: Config, compile: Behavior) -> TestPipeline {
        TestPipeline::with_registry(
            Arc::new(config),
            registry(vec![
                Scripted::new(PRE_VALIDATION, Behavior::Pass),
                Scripted::new(COMPILATION_VALIDATION, compile),
                Scripted::new(SYNTAX_VALIDATION, Behavior::Pass),
            ]),
        )
    }

    #[tokio::test]
    async fn test_all_stages_pass() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Pass);

        let result = pipeline.execute(&ctx(), dir.path()).await?;
        assert!(result.success);
        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(result.completed_stages, 3);
        assert_eq!(
            result.stages.names(),
            vec![PRE_VALIDATION, COMPILATION_VALIDATION, SYNTAX_VALIDATION]
        );
        assert_eq!(pipeline.status().state, PipelineState::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_required_failure_stops_run() -> Result<()> {
        let dir = TempDir::new()?;
        let result = pipeline(base_config(), Behavior::Fail)
            .execute(&ctx(), dir.path())
            .await?;

        assert!(!result.success);
        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.total_stages, 3);
        assert_eq!(result.completed_stages, 2);
        assert!(!result.stages.contains(SYNTAX_VALIDATION));
        assert_eq!(result.errors, vec![format!("{COMPILATION_VALIDATION} failed")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_every_stage() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = base_config();
        config.pipeline.continue_on_failure = true;

        let result = pipeline(config, Behavior::Fail)
            .execute(&ctx(), dir.path())
            .await?;
        assert!(!result.success);
        assert_eq!(result.completed_stages, 3);
        assert!(result.stages.get(SYNTAX_VALIDATION).is_some_and(|stage| stage.success));
        Ok(())
    }

    #[tokio::test]
    async fn test_optional_stage_does_not_decide_success() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Pass)
            .with_stage(false, Scripted::new("license_check", Behavior::Fail));

        let result = pipeline.execute(&ctx(), dir.path()).await?;
        assert!(result.success);
        assert_eq!(result.completed_stages, 4);
        assert_eq!(result.failed_stages(), vec!["license_check"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::FlakySpawn(AtomicU32::new(2)));

        let result = pipeline.execute(&ctx(), dir.path()).await?;
        assert!(result.success);
        Ok(())
    }

    #[tokio::test]
    async fn test_execution_error_fails_pipeline() {
        let dir = TempDir::new().expect("create temp dir");
        let pipeline = pipeline(base_config(), Behavior::Broken);

        let error = pipeline.execute(&ctx(), dir.path()).await.unwrap_err();
        assert!(matches!(error, Error::StageExecution { ref stage, .. } if stage == COMPILATION_VALIDATION));
        assert_eq!(pipeline.status().state, PipelineState::Failed);

        let partial = pipeline.last_result().expect("partial result");
        assert_eq!(partial.completed_stages, 2);
        assert!(!partial.success);
    }

    #[tokio::test]
    async fn test_concurrent_execute_is_busy() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Sleep(Duration::from_millis(300)));
        let ctx = ctx();

        let (first, second) = tokio::join!(pipeline.execute(&ctx, dir.path()), async {
            sleep(Duration::from_millis(50)).await;
            pipeline.execute(&ctx, dir.path()).await
        });

        assert!(first?.success);
        assert!(matches!(second, Err(Error::Busy)));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_returns_canceled_result() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Sleep(Duration::from_secs(30)));
        let token = CancelToken::new();
        let ctx = RunContext::new(token.clone(), Duration::from_secs(60));

        let canceller = async {
            sleep(Duration::from_millis(100)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(pipeline.execute(&ctx, dir.path()), canceller);
        let result = result?;

        assert_eq!(result.state, PipelineState::Canceled);
        assert!(!result.success);
        assert_eq!(result.completed_stages, 2);
        assert!(result.errors.iter().any(|error| error.contains("canceled")));
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_fails_pipeline() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Sleep(Duration::from_secs(30)));
        let ctx = RunContext::new(CancelToken::new(), Duration::from_millis(200));

        let result = pipeline.execute(&ctx, dir.path()).await?;
        assert_eq!(result.state, PipelineState::Failed);
        assert!(result.errors.iter().any(|error| error.contains("Timeout")));
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let pipeline = pipeline(base_config(), Behavior::Fail);

        let first = pipeline.execute(&ctx(), dir.path()).await?;
        let second = pipeline.execute(&ctx(), dir.path()).await?;
        assert_eq!(first.success, second.success);
        assert_eq!(first.stages.names(), second.stages.names());
        assert_eq!(first.errors, second.errors);
        Ok(())
    }
}
