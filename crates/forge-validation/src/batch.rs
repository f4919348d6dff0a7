//! Running the pipeline over many projects, sequentially or on a bounded worker pool.

use crate::diagnostics::{DiagnosticReport, DiagnosticsEngine};
use crate::pipeline::TestPipeline;
use crate::validator::{ValidatorRegistry, elapsed_ms};
use chrono::Utc;
use forge_core::{
    BatchTestRequest, BatchTestResult, CancelToken, Config, Error, Result, RunContext, TestResult,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use uuid::Uuid;

const NOT_RUN_AFTER_FAILURE: &str = "not run: batch stopped after an earlier failure";
const NOT_RUN_CANCELED: &str = "not run: batch canceled";

/// A project result with the diagnosis made for it, if it failed.
type Diagnosed = (TestResult, Option<DiagnosticReport>);

/// A batch result together with the diagnostic reports of its failed projects.
#[derive(Debug, Clone)]
pub struct DiagnosedBatch {
    /// Aggregated batch outcome
    pub batch: BatchTestResult,
    /// One report per failed project, in input order
    pub reports: Vec<DiagnosticReport>,
}

/// Validates batches of projects.
///
/// Every project gets a fresh [`TestPipeline`]; failed projects are
/// diagnosed and the recommendations are attached to their result.
#[derive(Clone)]
pub struct BatchRunner {
    config: Arc<Config>,
    registry: ValidatorRegistry,
    diagnostics: Arc<DiagnosticsEngine>,
}

impl BatchRunner {
    /// Runner using the standard validators.
    pub fn new(config: Arc<Config>) -> Self {
        let registry = ValidatorRegistry::standard(&config);
        Self::with_registry(config, registry)
    }

    /// Runner using a custom validator registry.
    pub fn with_registry(config: Arc<Config>, registry: ValidatorRegistry) -> Self {
        let diagnostics = Arc::new(DiagnosticsEngine::new(Arc::clone(&config)));
        Self {
            config,
            registry,
            diagnostics,
        }
    }

    /// Run-context for one project: a child of `cancel` with the pipeline deadline.
    fn project_context(&self, cancel: &CancelToken) -> RunContext {
        RunContext::new(cancel.child(), self.config.timeout())
    }

    /// Validate one project end to end.
    ///
    /// Execution errors become a failed result; failures carry the
    /// diagnostics recommendations.
    pub async fn run_project(&self, ctx: &RunContext, project: &Path) -> TestResult {
        self.run_project_diagnosed(ctx, project).await.0
    }

    async fn run_project_diagnosed(&self, ctx: &RunContext, project: &Path) -> Diagnosed {
        let test_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let start = Instant::now();
        let pipeline = TestPipeline::with_registry(Arc::clone(&self.config), self.registry.clone());

        let result = match pipeline.execute(ctx, project).await {
            Ok(pipeline_result) => TestResult::from_pipeline(test_id, timestamp, pipeline_result),
            Err(error) => {
                tracing::warn!("Validation of {} could not run: {error}", project.display());
                let mut result = TestResult::execution_failure(
                    test_id,
                    project.to_path_buf(),
                    timestamp,
                    error.to_string(),
                    elapsed_ms(start),
                );
                result.pipeline = pipeline.last_result();
                result
            }
        };
        self.diagnose(result)
    }

    fn diagnose(&self, mut result: TestResult) -> Diagnosed {
        if result.success {
            return (result, None);
        }
        let report = self.diagnostics.analyze_failures(
            &result.project_path,
            &result,
            result.pipeline.as_ref(),
        );
        result.recommendations.extend(report.recommendations.iter().cloned());
        (result, Some(report))
    }

    fn not_run(&self, project: &Path, reason: &str) -> Diagnosed {
        self.diagnose(TestResult::execution_failure(
            Uuid::new_v4(),
            project.to_path_buf(),
            Utc::now(),
            reason,
            0,
        ))
    }

    /// Validate every project in `request`.
    ///
    /// Results come back in input order and always satisfy
    /// `completed_tests + failed_tests == total_servers`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRequest`] for duplicate paths, a zero worker
    /// budget or a request id that is not a plain file name component.
    pub async fn run_batch_tests(
        &self,
        cancel: &CancelToken,
        request: &BatchTestRequest,
    ) -> Result<BatchTestResult> {
        Ok(self.run_batch_diagnosed(cancel, request).await?.batch)
    }

    /// Like [`Self::run_batch_tests`], also handing back the diagnostic
    /// report made for each failed project.
    ///
    /// # Errors
    /// Same as [`Self::run_batch_tests`].
    pub async fn run_batch_diagnosed(
        &self,
        cancel: &CancelToken,
        request: &BatchTestRequest,
    ) -> Result<DiagnosedBatch> {
        validate_request(request)?;

        let start = Instant::now();
        let total = request.server_paths.len();
        let batch_token = cancel.child();

        tracing::info!(
            "Starting batch {} with {} projects ({})",
            request.request_id,
            total,
            if request.parallel { "parallel" } else { "sequential" }
        );

        let (slots, stopped_on_failure) = if request.parallel {
            self.run_parallel(&batch_token, request).await
        } else {
            self.run_sequential(&batch_token, request).await
        };

        let reason = if stopped_on_failure {
            NOT_RUN_AFTER_FAILURE
        } else {
            NOT_RUN_CANCELED
        };
        let (results, reports): (Vec<TestResult>, Vec<Option<DiagnosticReport>>) = slots
            .into_iter()
            .zip(&request.server_paths)
            .map(|(slot, path)| slot.unwrap_or_else(|| self.not_run(path, reason)))
            .unzip();

        let completed_tests = results.iter().filter(|result| result.success).count();
        let batch = BatchTestResult {
            request_id: request.request_id.clone(),
            total_servers: total,
            completed_tests,
            failed_tests: total - completed_tests,
            results,
            duration_ms: elapsed_ms(start),
        };

        tracing::info!(
            "Batch {} finished: {} passed, {} failed in {}ms",
            batch.request_id,
            batch.completed_tests,
            batch.failed_tests,
            batch.duration_ms
        );
        Ok(DiagnosedBatch {
            batch,
            reports: reports.into_iter().flatten().collect(),
        })
    }

    async fn run_sequential(
        &self,
        batch_token: &CancelToken,
        request: &BatchTestRequest,
    ) -> (Vec<Option<Diagnosed>>, bool) {
        let mut slots: Vec<Option<Diagnosed>> = vec![None; request.server_paths.len()];
        let mut stopped_on_failure = false;

        for (slot, path) in slots.iter_mut().zip(&request.server_paths) {
            if batch_token.is_cancelled() {
                break;
            }
            let outcome = self
                .run_project_diagnosed(&self.project_context(batch_token), path)
                .await;
            let failed = !outcome.0.success;
            *slot = Some(outcome);

            if failed && request.stop_on_failure {
                tracing::info!("Stopping batch after failure of {}", path.display());
                stopped_on_failure = true;
                batch_token.cancel();
            }
        }
        (slots, stopped_on_failure)
    }

    async fn run_parallel(
        &self,
        batch_token: &CancelToken,
        request: &BatchTestRequest,
    ) -> (Vec<Option<Diagnosed>>, bool) {
        let total = request.server_paths.len();
        let workers = request
            .max_workers
            .unwrap_or(self.config.batch.max_concurrent_workers)
            .min(total)
            .max(1);

        let mut slots: Vec<Option<Diagnosed>> = vec![None; total];
        let mut stopped_on_failure = false;
        let mut join_set = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut next = 0;

        loop {
            while join_set.len() < workers && next < total && !batch_token.is_cancelled() {
                let runner = self.clone();
                let ctx = self.project_context(batch_token);
                let path = request.server_paths[next].clone();
                let index = next;

                let handle = join_set.spawn(async move {
                    let outcome = runner.run_project_diagnosed(&ctx, &path).await;
                    (index, outcome)
                });
                in_flight.insert(handle.id(), index);
                next += 1;
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };

            let (index, outcome) = match joined {
                Ok((id, published)) => {
                    in_flight.remove(&id);
                    published
                }
                Err(join_error) => {
                    let Some(index) = in_flight.remove(&join_error.id()) else {
                        continue;
                    };
                    let path = &request.server_paths[index];
                    tracing::warn!("Worker for {} failed: {join_error}", path.display());
                    let failure = TestResult::execution_failure(
                        Uuid::new_v4(),
                        path.clone(),
                        Utc::now(),
                        format!("worker failed: {join_error}"),
                        0,
                    );
                    (index, self.diagnose(failure))
                }
            };

            let failed = !outcome.0.success;
            slots[index] = Some(outcome);
            if failed && request.stop_on_failure && !batch_token.is_cancelled() {
                tracing::info!(
                    "Stopping batch after failure of {}",
                    request.server_paths[index].display()
                );
                stopped_on_failure = true;
                batch_token.cancel();
            }
        }
        (slots, stopped_on_failure)
    }
}

fn validate_request(request: &BatchTestRequest) -> Result<()> {
    let id = &request.request_id;
    let plain = id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if id.is_empty() || id.starts_with('.') || !plain {
        return Err(Error::InvalidRequest(format!("invalid request id: {id:?}")));
    }
    if request.max_workers == Some(0) {
        return Err(Error::InvalidRequest("max_workers must be at least 1".to_owned()));
    }
    let mut seen: HashSet<&PathBuf> = HashSet::new();
    for path in &request.server_paths {
        if !seen.insert(path) {
            return Err(Error::InvalidRequest(format!(
                "duplicate project path: {}",
                path.display()
            )));
        }
    }
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
    use crate::validator::Validator;
    use async_trait::async_trait;
    use core::time::Duration;
    use forge_core::stage::{COMPILATION_VALIDATION, PRE_VALIDATION, SYNTAX_VALIDATION};
    use forge_core::{PipelineState, ValidationResult};
    use tokio::time::sleep;

    /// Fails any project whose directory name starts with "bad".
    struct NameCheck(&'static str);

    #[async_trait]
    impl Validator for NameCheck {
        fn name(&self) -> &str {
            self.0
        }

        fn supports_async(&self) -> bool {
            false
        }

        async fn validate(&self, _ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
            let bad = project
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("bad"));
            Ok(if bad {
                ValidationResult::failed("main.go:1:1: syntax error: unexpected }")
            } else {
                ValidationResult::passed()
            })
        }
    }

    /// Build stage that takes thirty seconds for projects named "slow*".
    struct SlowBuild;

    #[async_trait]
    impl Validator for SlowBuild {
        fn name(&self) -> &str {
            COMPILATION_VALIDATION
        }

        fn supports_async(&self) -> bool {
            true
        }

        async fn validate(&self, _ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
            let slow = project
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("slow"));
            if slow {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(ValidationResult::passed())
        }
    }

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.features.security_scanning = false;
        config.features.linting = false;
        Arc::new(config)
    }

    fn runner() -> BatchRunner {
        let mut registry = ValidatorRegistry::new();
        for stage in [PRE_VALIDATION, COMPILATION_VALIDATION, SYNTAX_VALIDATION] {
            registry.register(Arc::new(NameCheck(stage)));
        }
        BatchRunner::with_registry(test_config(), registry)
    }

    fn slow_runner() -> BatchRunner {
        let mut registry = ValidatorRegistry::new();
        registry.register(Arc::new(NameCheck(PRE_VALIDATION)));
        registry.register(Arc::new(SlowBuild));
        registry.register(Arc::new(NameCheck(SYNTAX_VALIDATION)));
        BatchRunner::with_registry(test_config(), registry)
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|name| PathBuf::from(format!("/projects/{name}"))).collect()
    }

    #[tokio::test]
    async fn test_rejects_duplicate_paths() {
        let request = BatchTestRequest::new(paths(&["good", "good"]));
        let outcome = runner().run_batch_tests(&CancelToken::new(), &request).await;
        assert!(matches!(outcome, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_rejects_zero_workers() {
        let request = BatchTestRequest::new(paths(&["good"])).with_max_workers(0);
        let outcome = runner().run_batch_tests(&CancelToken::new(), &request).await;
        assert!(matches!(outcome, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_rejects_request_ids_that_are_not_file_names() {
        for id in ["", "../escape", "a/b", "a\\b", ".hidden"] {
            let mut request = BatchTestRequest::new(paths(&["good"]));
            request.request_id = id.to_owned();
            let outcome = runner().run_batch_tests(&CancelToken::new(), &request).await;
            assert!(matches!(outcome, Err(Error::InvalidRequest(_))), "accepted {id:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_batch() -> Result<()> {
        let request = BatchTestRequest::new(Vec::new());
        let batch = runner().run_batch_tests(&CancelToken::new(), &request).await?;
        assert_eq!(batch.total_servers, 0);
        assert!(batch.results.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_counts_hold_for_every_mode() -> Result<()> {
        let names = ["good-1", "bad-1", "good-2", "bad-2", "good-3"];
        for parallel in [false, true] {
            for stop_on_failure in [false, true] {
                let request = BatchTestRequest::new(paths(&names))
                    .with_parallel(parallel)
                    .with_max_workers(2)
                    .with_stop_on_failure(stop_on_failure);
                let batch = runner().run_batch_tests(&CancelToken::new(), &request).await?;

                assert_eq!(batch.total_servers, names.len());
                assert_eq!(batch.results.len(), names.len());
                assert_eq!(batch.completed_tests + batch.failed_tests, batch.total_servers);
                let order: Vec<&PathBuf> = batch.results.iter().map(|result| &result.project_path).collect();
                assert_eq!(order, request.server_paths.iter().collect::<Vec<_>>());
                if !stop_on_failure {
                    assert_eq!(batch.completed_tests, 3);
                    assert_eq!(batch.failed_tests, 2);
                }
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_on_failure_marks_remaining_not_run() -> Result<()> {
        let request = BatchTestRequest::new(paths(&["good", "bad", "later"])).with_stop_on_failure(true);
        let batch = runner().run_batch_tests(&CancelToken::new(), &request).await?;

        assert_eq!(batch.completed_tests, 1);
        assert_eq!(batch.failed_tests, 2);
        let later = batch.get(Path::new("/projects/later")).expect("later result");
        assert_eq!(later.errors, vec![NOT_RUN_AFTER_FAILURE.to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_projects_get_recommendations() -> Result<()> {
        let request = BatchTestRequest::new(paths(&["good", "bad"]));
        let batch = runner().run_batch_tests(&CancelToken::new(), &request).await?;

        let bad = batch.get(Path::new("/projects/bad")).expect("bad result");
        assert!(!bad.success);
        assert!(!bad.recommendations.is_empty());
        let good = batch.get(Path::new("/projects/good")).expect("good result");
        assert!(good.recommendations.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_canceled_batch_accounts_for_every_project() -> Result<()> {
        let cancel = CancelToken::new();
        cancel.cancel();
        let request = BatchTestRequest::new(paths(&["good-1", "good-2"])).with_parallel(true);
        let batch = runner().run_batch_tests(&cancel, &request).await?;

        assert_eq!(batch.failed_tests, 2);
        assert!(batch.results.iter().all(|result| result.errors == vec![NOT_RUN_CANCELED.to_owned()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_fast_failure_cancels_slow_project_in_flight() -> Result<()> {
        let request = BatchTestRequest::new(paths(&["slow", "bad"]))
            .with_parallel(true)
            .with_max_workers(2)
            .with_stop_on_failure(true);

        let start = Instant::now();
        let batch = slow_runner().run_batch_tests(&CancelToken::new(), &request).await?;

        assert!(start.elapsed() < Duration::from_secs(10), "batch waited for the slow build");
        assert_eq!(batch.completed_tests + batch.failed_tests, batch.total_servers);
        assert_eq!(batch.failed_tests, 2);

        let slow = batch.get(Path::new("/projects/slow")).expect("slow result");
        assert!(!slow.success);
        let pipeline = slow.pipeline.as_ref().expect("slow pipeline result");
        assert_eq!(pipeline.state, PipelineState::Canceled);
        assert!(slow.errors.iter().any(|error| error.contains("canceled")));
        Ok(())
    }

    #[tokio::test]
    async fn test_diagnosed_batch_returns_one_report_per_failure() -> Result<()> {
        let request = BatchTestRequest::new(paths(&["bad-1", "good", "bad-2"]));
        let diagnosed = runner().run_batch_diagnosed(&CancelToken::new(), &request).await?;

        let diagnosed_paths: Vec<&Path> = diagnosed
            .reports
            .iter()
            .map(|report| report.project_path.as_path())
            .collect();
        assert_eq!(
            diagnosed_paths,
            vec![Path::new("/projects/bad-1"), Path::new("/projects/bad-2")]
        );
        for report in &diagnosed.reports {
            let result = diagnosed.batch.get(&report.project_path).expect("result");
            assert_eq!(result.test_id, report.test_id);
            assert_eq!(result.recommendations, report.recommendations);
        }
        Ok(())
    }
}
