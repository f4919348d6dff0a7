//! Integration tests for `TestPipeline`, `BatchRunner`, diagnostics and reporting.
//!
//! Projects are real directories on disk; the build step is a shell command so
//! the tests do not depend on an installed language toolchain.

#![cfg(unix)]
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

mod common;

use common::{INVALID_MAIN, VALID_MAIN, Workspace, config, ctx, shared_config};
use forge_core::stage::{PRE_VALIDATION, SECURITY_SCANNING, SYNTAX_VALIDATION};
use forge_core::{BatchTestRequest, CancelToken, Config, PipelineState, ReportFormat};
use forge_validation::{
    BatchRunner, DiagnosticsEngine, FailureType, Reporter, TestPipeline, compute_metrics,
};
use std::fs;
use std::sync::Arc;

#[tokio::test]
async fn test_valid_project_passes_every_stage() {
    let workspace = Workspace::new();
    let project = workspace.project("valid", VALID_MAIN);

    let pipeline = TestPipeline::new(shared_config());
    let result = pipeline.execute(&ctx(), &project).await.unwrap();

    assert!(result.success, "unexpected errors: {:?}", result.errors);
    assert_eq!(result.state, PipelineState::Completed);
    assert_eq!(result.completed_stages, result.total_stages);
    assert!(result.stages.contains(SECURITY_SCANNING));
}

#[tokio::test]
async fn test_invalid_project_stops_at_syntax() {
    let workspace = Workspace::new();
    let project = workspace.project("invalid", INVALID_MAIN);

    let pipeline = TestPipeline::new(shared_config());
    let result = pipeline.execute(&ctx(), &project).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.state, PipelineState::Failed);
    assert_eq!(result.failed_stages(), vec![SYNTAX_VALIDATION]);
    assert!(!result.stages.contains(SECURITY_SCANNING));
    assert!(result.errors.iter().any(|error| error.contains("syntax error")));
}

#[tokio::test]
async fn test_missing_project_fails_pre_validation() {
    let workspace = Workspace::new();
    let project = workspace.root().join("does-not-exist");

    let result = TestPipeline::new(shared_config())
        .execute(&ctx(), &project)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_stages(), vec![PRE_VALIDATION]);
    assert_eq!(result.completed_stages, 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let workspace = Workspace::new();
    let project = workspace.project("invalid", INVALID_MAIN);
    let pipeline = TestPipeline::new(shared_config());

    let first = pipeline.execute(&ctx(), &project).await.unwrap();
    let second = pipeline.execute(&ctx(), &project).await.unwrap();

    assert_eq!(first.success, second.success);
    assert_eq!(first.errors, second.errors);
    assert_eq!(first.stages.names(), second.stages.names());
    assert!(!pipeline.status().running);
}

#[tokio::test]
async fn test_diagnostics_classify_syntax_failure() {
    let workspace = Workspace::new();
    let project = workspace.project("invalid", INVALID_MAIN);
    let runner = BatchRunner::new(shared_config());

    let test_result = runner.run_project(&ctx(), &project).await;
    assert!(!test_result.success);
    assert!(!test_result.recommendations.is_empty());

    let engine = DiagnosticsEngine::new(shared_config());
    let report = engine.analyze_failures(&project, &test_result, test_result.pipeline.as_ref());
    assert_eq!(report.failure_analysis.failure_type, FailureType::SyntaxError);
    assert_eq!(
        report.failure_analysis.failed_stages,
        vec![SYNTAX_VALIDATION.to_owned()]
    );
    assert!(!report.troubleshooting_guide.is_empty());
}

#[tokio::test]
async fn test_missing_toolchain_is_an_execution_failure() {
    let workspace = Workspace::new();
    let project = workspace.project("valid", VALID_MAIN);
    let mut config = config();
    config.toolchain.build = vec!["forge-definitely-missing-build-tool".to_owned()];

    let runner = BatchRunner::new(Arc::new(config));
    let test_result = runner.run_project(&ctx(), &project).await;

    assert!(!test_result.success);
    assert!(test_result.errors[0].contains("Toolchain not found"));
    assert!(test_result.pipeline.is_some());
    assert!(!test_result.recommendations.is_empty());
}

#[tokio::test]
async fn test_batch_of_valid_and_invalid_projects() {
    let workspace = Workspace::new();
    let valid = workspace.project("valid", VALID_MAIN);
    let invalid = workspace.project("invalid", INVALID_MAIN);
    let runner = BatchRunner::new(shared_config());

    for parallel in [false, true] {
        for stop_on_failure in [false, true] {
            let request = BatchTestRequest::new(vec![valid.clone(), invalid.clone()])
                .with_parallel(parallel)
                .with_stop_on_failure(stop_on_failure);
            let batch = runner
                .run_batch_tests(&CancelToken::new(), &request)
                .await
                .unwrap();

            assert_eq!(batch.total_servers, 2);
            assert_eq!(batch.completed_tests, 1);
            assert_eq!(batch.failed_tests, 1);
            assert_eq!(batch.results[0].project_path, valid);
            assert_eq!(batch.results[1].project_path, invalid);
            assert!(batch.get(&valid).unwrap().success);
        }
    }
}

#[tokio::test]
async fn test_parallel_batch_respects_worker_budget() {
    let workspace = Workspace::new();
    let paths: Vec<_> = (0..6)
        .map(|index| workspace.project(&format!("valid-{index}"), VALID_MAIN))
        .collect();

    let request = BatchTestRequest::new(paths)
        .with_parallel(true)
        .with_max_workers(2);
    let batch = BatchRunner::new(shared_config())
        .run_batch_tests(&CancelToken::new(), &request)
        .await
        .unwrap();

    assert!(batch.all_passed());
    assert_eq!(batch.completed_tests, 6);
}

#[tokio::test]
async fn test_reports_are_written_and_scored() {
    let workspace = Workspace::new();
    let valid = workspace.project("valid", VALID_MAIN);
    let invalid = workspace.project("invalid", INVALID_MAIN);

    let mut config = config();
    config.reporting.output_path = workspace.root().join("reports");
    config.reporting.format = ReportFormat::Text;
    let config = Arc::new(config);

    let runner = BatchRunner::new(Arc::clone(&config));
    let passed = runner.run_project(&ctx(), &valid).await;
    let failed = runner.run_project(&ctx(), &invalid).await;

    let passed_score = compute_metrics(&passed).overall_score;
    let failed_score = compute_metrics(&failed).overall_score;
    assert!((passed_score - 100.0).abs() < f64::EPSILON);
    assert!(failed_score < passed_score);

    let reporter = Reporter::new(config);
    let path = reporter.generate_report(&failed).unwrap();
    assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("txt"));
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("FAILED"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let workspace = Workspace::new();
    let path = workspace.root().join("forge.toml");
    fs::write(&path, "[batch]\nmax_concurrent_workers = 0\n").unwrap();

    let error = Config::load_from_file(&path).unwrap_err();
    assert!(error.to_string().contains("max_concurrent_workers"));
}
