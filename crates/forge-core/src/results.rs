//! Result data produced by validators, pipelines and batches.
//!
//! Every type here is plain data: created fresh per invocation, owned by the
//! producer, and never mutated after being handed onward.

use chrono::{DateTime, Utc};
use core::fmt;
use core::marker::PhantomData;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Outcome of a single validator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the project passed this check
    pub success: bool,
    /// Blocking problems found
    pub errors: Vec<String>,
    /// Non-blocking problems found
    pub warnings: Vec<String>,
    /// Number of files examined
    pub files_checked: usize,
    /// Elapsed time in milliseconds
    pub duration_ms: u64,
}

impl ValidationResult {
    /// A passing result with no findings.
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A failing result with a single error.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Self::default()
        }
    }

    /// Record a blocking error and mark the result failed.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }

    /// Record a non-blocking warning.
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Set the elapsed time.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set the number of files examined.
    #[must_use]
    pub fn with_files_checked(mut self, files_checked: usize) -> Self {
        self.files_checked = files_checked;
        self
    }
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage identifier
    pub name: String,
    /// Whether this stage decides overall success
    pub required: bool,
    /// Whether the stage passed
    pub success: bool,
    /// Summary error, when the stage failed
    pub error: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Validator output, absent when the validator could not run to completion
    pub validation: Option<ValidationResult>,
}

impl StageResult {
    /// Build a stage result from a finished validator run.
    pub fn from_validation(
        name: impl Into<String>,
        required: bool,
        validation: ValidationResult,
        duration_ms: u64,
    ) -> Self {
        let error = if validation.success {
            None
        } else {
            Some(
                validation
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "stage reported failure".to_owned()),
            )
        };
        Self {
            name: name.into(),
            required,
            success: validation.success,
            error,
            duration_ms,
            validation: Some(validation),
        }
    }

    /// Build a stage result for a validator that was aborted or errored.
    pub fn aborted(
        name: impl Into<String>,
        required: bool,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            required,
            success: false,
            error: Some(error.into()),
            duration_ms,
            validation: None,
        }
    }
}

/// Stage results keyed by stage name, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageResults {
    entries: Vec<StageResult>,
}

impl StageResults {
    /// Insert a result, replacing any earlier result for the same stage.
    pub fn insert(&mut self, result: StageResult) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.name == result.name)
        {
            *existing = result;
        } else {
            self.entries.push(result);
        }
    }

    /// Look up a stage result by name.
    pub fn get(&self, name: &str) -> Option<&StageResult> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Whether a result exists for the stage.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over results in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageResult> {
        self.entries.iter()
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// Number of recorded stages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no stage has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for StageResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.name, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageResults {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageResultsVisitor(PhantomData<StageResults>);

        impl<'de> Visitor<'de> for StageResultsVisitor {
            type Value = StageResults;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of stage name to stage result")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<StageResults, M::Error> {
                let mut results = StageResults::default();
                while let Some((_name, entry)) = access.next_entry::<String, StageResult>()? {
                    results.insert(entry);
                }
                Ok(results)
            }
        }

        deserializer.deserialize_map(StageResultsVisitor(PhantomData))
    }
}

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No execution has started
    Idle,
    /// An execution is in flight
    Running,
    /// Every required stage passed
    Completed,
    /// A required stage failed, the deadline passed, or a stage could not execute
    Failed,
    /// The run was canceled
    Canceled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

/// Aggregated outcome of one pipeline run over one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Project that was validated
    pub project_path: PathBuf,
    /// Terminal state
    pub state: PipelineState,
    /// Number of planned stages
    pub total_stages: usize,
    /// Number of stages that recorded a result
    pub completed_stages: usize,
    /// AND of every required stage's success
    pub success: bool,
    /// Stage results in execution order
    pub stages: StageResults,
    /// Aggregated error strings
    pub errors: Vec<String>,
    /// Aggregated warning strings
    pub warnings: Vec<String>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Names of recorded stages that failed.
    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| !stage.success)
            .map(|stage| stage.name.as_str())
            .collect()
    }
}

/// Per-project summary used by reporting and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Unique test identifier
    pub test_id: Uuid,
    /// Project that was validated
    pub project_path: PathBuf,
    /// When the test started
    pub timestamp: DateTime<Utc>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Whether the project passed
    pub success: bool,
    /// Checks that passed
    pub passed: usize,
    /// Checks that failed
    pub failed: usize,
    /// Checks that did not run
    pub skipped: usize,
    /// Flattened error strings
    pub errors: Vec<String>,
    /// Flattened warning strings
    pub warnings: Vec<String>,
    /// Remediation advice appended by diagnostics
    pub recommendations: Vec<String>,
    /// Pipeline result, when the pipeline produced one
    pub pipeline: Option<PipelineResult>,
}

impl TestResult {
    /// Summarize a finished pipeline run.
    pub fn from_pipeline(
        test_id: Uuid,
        timestamp: DateTime<Utc>,
        pipeline: PipelineResult,
    ) -> Self {
        let passed = pipeline.stages.iter().filter(|stage| stage.success).count();
        let failed = pipeline.completed_stages.saturating_sub(passed);
        let skipped = pipeline
            .total_stages
            .saturating_sub(pipeline.completed_stages);

        Self {
            test_id,
            project_path: pipeline.project_path.clone(),
            timestamp,
            duration_ms: pipeline.duration_ms,
            success: pipeline.success,
            passed,
            failed,
            skipped,
            errors: pipeline.errors.clone(),
            warnings: pipeline.warnings.clone(),
            recommendations: Vec::new(),
            pipeline: Some(pipeline),
        }
    }

    /// Record a project that could not be validated at all.
    pub fn execution_failure(
        test_id: Uuid,
        project_path: PathBuf,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            test_id,
            project_path,
            timestamp,
            duration_ms,
            success: false,
            passed: 0,
            failed: 1,
            skipped: 0,
            errors: vec![error.into()],
            warnings: Vec::new(),
            recommendations: Vec::new(),
            pipeline: None,
        }
    }

    /// Total number of checks accounted for.
    pub fn total_checks(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

/// Request to validate many projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTestRequest {
    /// Request identifier
    pub request_id: String,
    /// Project paths in input order
    pub server_paths: Vec<PathBuf>,
    /// Run pipelines concurrently
    pub parallel: bool,
    /// Worker budget override
    pub max_workers: Option<usize>,
    /// Cancel the remaining batch after the first failure
    pub stop_on_failure: bool,
}

impl BatchTestRequest {
    /// Sequential, run-everything request with a fresh identifier.
    pub fn new(server_paths: Vec<PathBuf>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            server_paths,
            parallel: false,
            max_workers: None,
            stop_on_failure: false,
        }
    }

    /// Toggle parallel execution.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Override the worker budget.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Toggle stop-on-failure.
    #[must_use]
    pub fn with_stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.stop_on_failure = stop_on_failure;
        self
    }
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTestResult {
    /// Request identifier
    pub request_id: String,
    /// Number of requested projects
    pub total_servers: usize,
    /// Projects whose pipeline succeeded
    pub completed_tests: usize,
    /// Projects that failed, errored or were not run
    pub failed_tests: usize,
    /// Per-project results, one per requested path and in request order.
    ///
    /// Kept as a sequence rather than a map so serialized reports list
    /// projects in the order they were requested; paths are unique within a
    /// batch, so [`Self::get`] is the keyed lookup.
    pub results: Vec<TestResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
}

impl BatchTestResult {
    /// Look up the result for a project path.
    pub fn get(&self, project_path: &Path) -> Option<&TestResult> {
        self.results
            .iter()
            .find(|result| result.project_path == project_path)
    }

    /// Whether every project passed.
    pub fn all_passed(&self) -> bool {
        self.failed_tests == 0
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;

    fn stage(name: &str, success: bool) -> StageResult {
        let validation = if success {
            ValidationResult::passed()
        } else {
            ValidationResult::failed(format!("{name} failed"))
        };
        StageResult::from_validation(name, true, validation, 5)
    }

    #[test]
    fn test_stage_results_preserve_insertion_order() {
        let mut results = StageResults::default();
        results.insert(stage("pre_validation", true));
        results.insert(stage("compilation_validation", false));
        results.insert(stage("syntax_validation", true));

        assert_eq!(
            results.names(),
            vec!["pre_validation", "compilation_validation", "syntax_validation"]
        );
        assert!(results.contains("compilation_validation"));
        assert!(!results.contains("linting"));
    }

    #[test]
    fn test_stage_results_serialize_as_ordered_map() {
        let mut results = StageResults::default();
        results.insert(stage("zeta", true));
        results.insert(stage("alpha", false));

        let json = serde_json::to_string(&results).expect("serialize");
        let zeta = json.find("\"zeta\"").expect("zeta key");
        let alpha = json.find("\"alpha\"").expect("alpha key");
        assert!(zeta < alpha, "insertion order must survive serialization");

        let back: StageResults = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.names(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_failed_validation_sets_stage_error() {
        let result = stage("linting", false);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("linting failed"));
    }

    #[test]
    fn test_push_error_marks_failure() {
        let mut result = ValidationResult::passed();
        result.push_warning("long line");
        assert!(result.success);
        result.push_error("missing go.mod");
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_test_result_counts_from_pipeline() {
        let mut stages = StageResults::default();
        stages.insert(stage("pre_validation", true));
        stages.insert(stage("compilation_validation", false));

        let pipeline = PipelineResult {
            project_path: PathBuf::from("/tmp/project"),
            state: PipelineState::Failed,
            total_stages: 5,
            completed_stages: 2,
            success: false,
            stages,
            errors: vec!["compilation_validation failed".to_owned()],
            warnings: Vec::new(),
            duration_ms: 12,
        };

        let result = TestResult::from_pipeline(Uuid::new_v4(), Utc::now(), pipeline);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 3);
        assert_eq!(result.total_checks(), 5);
        assert!(!result.success);
    }

    #[test]
    fn test_batch_results_are_looked_up_by_path() {
        let result_for = |path: &str, success: bool| {
            let mut result = TestResult::execution_failure(
                Uuid::new_v4(),
                PathBuf::from(path),
                Utc::now(),
                "boom",
                1,
            );
            result.success = success;
            result
        };
        let batch = BatchTestResult {
            request_id: "req".to_owned(),
            total_servers: 2,
            completed_tests: 1,
            failed_tests: 1,
            results: vec![result_for("/p/b", false), result_for("/p/a", true)],
            duration_ms: 3,
        };

        assert!(batch.get(Path::new("/p/a")).is_some_and(|result| result.success));
        assert!(batch.get(Path::new("/p/b")).is_some_and(|result| !result.success));
        assert!(batch.get(Path::new("/p/c")).is_none());
        assert!(!batch.all_passed());
    }
}
