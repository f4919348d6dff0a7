//! Durable reports and the normalized quality score.

use forge_core::{BatchTestResult, Config, Error, ReportFormat, Result, TestResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Weight of an error raised by a security rule.
const SECURITY_ERROR_WEIGHT: f64 = 3.0;
/// Weight of any other error.
const ERROR_WEIGHT: f64 = 1.0;
/// Weight of a warning.
const WARNING_WEIGHT: f64 = 1.0;

/// Score inputs and the resulting overall score for one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    /// Checks accounted for
    pub total_checks: usize,
    /// Checks that passed
    pub passed: usize,
    /// Checks that failed
    pub failed: usize,
    /// Checks that did not run
    pub skipped: usize,
    /// Passed checks as a percentage of all checks
    pub pass_rate: f64,
    /// Severity-weighted error total
    pub weighted_errors: f64,
    /// Severity-weighted warning total
    pub weighted_warnings: f64,
    /// Normalized score in `[0, 100]`
    pub overall_score: f64,
}

fn error_weight(error: &str) -> f64 {
    if error.contains("security violation") {
        SECURITY_ERROR_WEIGHT
    } else {
        ERROR_WEIGHT
    }
}

/// Compute metrics for a test result. Pure: identical inputs give identical scores.
pub fn compute_metrics(test_result: &TestResult) -> TestMetrics {
    let total_checks = test_result.total_checks();
    let weighted_errors: f64 = test_result.errors.iter().map(|error| error_weight(error)).sum();
    let weighted_warnings = test_result.warnings.len() as f64 * WARNING_WEIGHT;

    let (pass_rate, overall_score) = if total_checks == 0 {
        let score = if test_result.success { 100.0 } else { 0.0 };
        (score, score)
    } else {
        let checks = total_checks as f64;
        let passed = test_result.passed as f64;
        let skipped = test_result.skipped as f64;
        let failed = test_result.failed as f64;

        let raw = 100.0 * (passed + 0.5 * skipped) / checks
            - 10.0 * failed
            - 2.0 * weighted_errors
            - 0.5 * weighted_warnings;
        (100.0 * passed / checks, raw.clamp(0.0, 100.0))
    };

    TestMetrics {
        total_checks,
        passed: test_result.passed,
        failed: test_result.failed,
        skipped: test_result.skipped,
        pass_rate,
        weighted_errors,
        weighted_warnings,
        overall_score,
    }
}

#[derive(Serialize)]
struct JsonReport<'report> {
    test_result: &'report TestResult,
    metrics: TestMetrics,
}

#[derive(Serialize)]
struct JsonBatchReport<'report> {
    batch: &'report BatchTestResult,
    metrics: Vec<TestMetrics>,
}

/// Writes test and batch reports in the configured format.
pub struct Reporter {
    config: Arc<Config>,
}

impl Reporter {
    /// Create a reporter writing below `reporting.output_path`.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Output format in use.
    pub fn format(&self) -> ReportFormat {
        self.config.reporting.format
    }

    /// Write `<output_path>/<test_id>.<ext>` and return its path.
    ///
    /// # Errors
    /// Returns an error if the report cannot be rendered or written.
    pub fn generate_report(&self, test_result: &TestResult) -> Result<PathBuf> {
        let metrics = compute_metrics(test_result);
        let contents = match self.format() {
            ReportFormat::Json => serde_json::to_string_pretty(&JsonReport {
                test_result,
                metrics,
            })?,
            ReportFormat::Text => render_text(test_result, &metrics),
            ReportFormat::Html => render_html(test_result, &metrics),
        };
        self.write(&test_result.test_id.to_string(), &contents)
    }

    /// Write `<output_path>/batch-<request_id>.<ext>` and return its path.
    ///
    /// # Errors
    /// Returns an error if the report cannot be rendered or written.
    pub fn generate_batch_report(&self, batch: &BatchTestResult) -> Result<PathBuf> {
        let metrics: Vec<TestMetrics> = batch.results.iter().map(compute_metrics).collect();
        let contents = match self.format() {
            ReportFormat::Json => {
                serde_json::to_string_pretty(&JsonBatchReport { batch, metrics })?
            }
            ReportFormat::Text => render_batch_text(batch, &metrics),
            ReportFormat::Html => render_batch_html(batch, &metrics),
        };
        self.write(&format!("batch-{}", file_stem(&batch.request_id)), &contents)
    }

    /// Metrics for a test result.
    pub fn generate_metrics_report(&self, test_result: &TestResult) -> TestMetrics {
        compute_metrics(test_result)
    }

    fn write(&self, stem: &str, contents: &str) -> Result<PathBuf> {
        let directory = &self.config.reporting.output_path;
        fs::create_dir_all(directory).map_err(|err| {
            Error::Report(format!("Failed to create {}: {err}", directory.display()))
        })?;

        let path = directory.join(format!("{stem}.{}", self.format().extension()));
        fs::write(&path, contents)
            .map_err(|err| Error::Report(format!("Failed to write {}: {err}", path.display())))?;

        tracing::info!("Wrote report to {}", path.display());
        Ok(path)
    }
}

/// Request ids reduced to characters that cannot leave the report directory.
fn file_stem(request_id: &str) -> String {
    request_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') { ch } else { '_' })
        .collect()
}

fn verdict(success: bool) -> &'static str {
    if success { "PASSED" } else { "FAILED" }
}

fn push_section(lines: &mut Vec<String>, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(title.to_owned());
    lines.extend(items.iter().map(|item| format!("  - {item}")));
}

fn render_text(test_result: &TestResult, metrics: &TestMetrics) -> String {
    let mut lines = vec![
        "Forge validation report".to_owned(),
        "=======================".to_owned(),
        format!("Test ID:    {}", test_result.test_id),
        format!("Project:    {}", test_result.project_path.display()),
        format!("Timestamp:  {}", test_result.timestamp.to_rfc3339()),
        format!("Result:     {}", verdict(test_result.success)),
        format!("Duration:   {}ms", test_result.duration_ms),
        format!(
            "Checks:     {} passed, {} failed, {} skipped",
            test_result.passed, test_result.failed, test_result.skipped
        ),
        format!("Score:      {:.1}", metrics.overall_score),
    ];

    if let Some(pipeline) = &test_result.pipeline {
        lines.push(String::new());
        lines.push("Stages".to_owned());
        for stage in pipeline.stages.iter() {
            let status = if stage.success { "PASS" } else { "FAIL" };
            let detail = stage
                .error
                .as_deref()
                .map(|error| format!(": {error}"))
                .unwrap_or_default();
            lines.push(format!(
                "  [{status}] {} ({}ms){detail}",
                stage.name, stage.duration_ms
            ));
        }
    }

    push_section(&mut lines, "Errors", &test_result.errors);
    push_section(&mut lines, "Warnings", &test_result.warnings);
    push_section(&mut lines, "Recommendations", &test_result.recommendations);

    lines.push(String::new());
    lines.join("\n")
}

fn render_batch_text(batch: &BatchTestResult, metrics: &[TestMetrics]) -> String {
    let mut lines = vec![
        "Forge batch validation report".to_owned(),
        "=============================".to_owned(),
        format!("Request ID: {}", batch.request_id),
        format!("Projects:   {}", batch.total_servers),
        format!("Passed:     {}", batch.completed_tests),
        format!("Failed:     {}", batch.failed_tests),
        format!("Duration:   {}ms", batch.duration_ms),
        String::new(),
    ];
    for (result, metric) in batch.results.iter().zip(metrics) {
        lines.push(format!(
            "  [{}] {} (score {:.1})",
            verdict(result.success),
            result.project_path.display(),
            metric.overall_score
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Escape text for inclusion in HTML.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(character),
        }
    }
    escaped
}

const HTML_STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
table{border-collapse:collapse}td,th{border:1px solid #ccc;padding:4px 8px;text-align:left}\
.pass{color:#1a7f37}.fail{color:#cf222e}";

fn html_page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>{HTML_STYLE}</style>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(title)
    )
}

fn html_list(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let entries: String = items
        .iter()
        .map(|item| format!("<li>{}</li>\n", escape_html(item)))
        .collect();
    format!("<h2>{}</h2>\n<ul>\n{entries}</ul>\n", escape_html(title))
}

fn status_class(success: bool) -> &'static str {
    if success { "pass" } else { "fail" }
}

fn render_html(test_result: &TestResult, metrics: &TestMetrics) -> String {
    let mut body = format!(
        "<h1>Forge validation report</h1>\n<table>\n\
<tr><th>Test ID</th><td>{}</td></tr>\n\
<tr><th>Project</th><td>{}</td></tr>\n\
<tr><th>Timestamp</th><td>{}</td></tr>\n\
<tr><th>Result</th><td class=\"{}\">{}</td></tr>\n\
<tr><th>Duration</th><td>{}ms</td></tr>\n\
<tr><th>Checks</th><td>{} passed, {} failed, {} skipped</td></tr>\n\
<tr><th>Score</th><td>{:.1}</td></tr>\n</table>\n",
        test_result.test_id,
        escape_html(&test_result.project_path.display().to_string()),
        test_result.timestamp.to_rfc3339(),
        status_class(test_result.success),
        verdict(test_result.success),
        test_result.duration_ms,
        test_result.passed,
        test_result.failed,
        test_result.skipped,
        metrics.overall_score,
    );

    if let Some(pipeline) = &test_result.pipeline {
        body.push_str("<h2>Stages</h2>\n<table>\n<tr><th>Stage</th><th>Status</th><th>Duration</th><th>Error</th></tr>\n");
        for stage in pipeline.stages.iter() {
            body.push_str(&format!(
                "<tr><td>{}</td><td class=\"{}\">{}</td><td>{}ms</td><td>{}</td></tr>\n",
                escape_html(&stage.name),
                status_class(stage.success),
                if stage.success { "pass" } else { "fail" },
                stage.duration_ms,
                escape_html(stage.error.as_deref().unwrap_or_default()),
            ));
        }
        body.push_str("</table>\n");
    }

    body.push_str(&html_list("Errors", &test_result.errors));
    body.push_str(&html_list("Warnings", &test_result.warnings));
    body.push_str(&html_list("Recommendations", &test_result.recommendations));

    html_page("Forge validation report", &body)
}

fn render_batch_html(batch: &BatchTestResult, metrics: &[TestMetrics]) -> String {
    let mut body = format!(
        "<h1>Forge batch validation report</h1>\n<p>Request {}: {} projects, {} passed, {} failed in {}ms</p>\n\
<table>\n<tr><th>Project</th><th>Result</th><th>Score</th></tr>\n",
        escape_html(&batch.request_id),
        batch.total_servers,
        batch.completed_tests,
        batch.failed_tests,
        batch.duration_ms,
    );
    for (result, metric) in batch.results.iter().zip(metrics) {
        body.push_str(&format!(
            "<tr><td>{}</td><td class=\"{}\">{}</td><td>{:.1}</td></tr>\n",
            escape_html(&result.project_path.display().to_string()),
            status_class(result.success),
            verdict(result.success),
            metric.overall_score,
        ));
    }
    body.push_str("</table>\n");
    html_page("Forge batch validation report", &body)
}

/// Default location for a test's diagnostic report next to its test report.
pub fn diagnostics_path(output_path: &Path, test_id: Uuid) -> PathBuf {
    output_path.join(format!("{test_id}.diagnostics.json"))
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use tempfile::TempDir;

    fn result(passed: usize, failed: usize, skipped: usize) -> TestResult {
        let mut result =
            TestResult::execution_failure(Uuid::new_v4(), PathBuf::from("demo"), Utc::now(), "", 10);
        result.errors.clear();
        result.success = failed == 0;
        result.passed = passed;
        result.failed = failed;
        result.skipped = skipped;
        result
    }

    fn reporter(dir: &Path, format: ReportFormat) -> Reporter {
        let mut config = Config::default();
        config.reporting.output_path = dir.to_path_buf();
        config.reporting.format = format;
        Reporter::new(Arc::new(config))
    }

    #[test]
    fn test_perfect_run_scores_100() {
        let metrics = compute_metrics(&result(7, 0, 0));
        assert!((metrics.overall_score - 100.0).abs() < f64::EPSILON);
        assert!((metrics.pass_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_check_set() {
        assert!((compute_metrics(&result(0, 0, 0)).overall_score - 100.0).abs() < f64::EPSILON);

        let mut failed = result(0, 0, 0);
        failed.success = false;
        assert!(compute_metrics(&failed).overall_score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_is_clamped_and_monotonic_in_failures() {
        let mut previous = f64::INFINITY;
        for failed in 0..12 {
            let mut test = result(3, failed, 2);
            test.errors = vec!["boom".to_owned(); failed];
            test.warnings = vec!["style".to_owned(); 4];
            let score = compute_metrics(&test).overall_score;
            assert!((0.0..=100.0).contains(&score), "score {score} out of range");
            assert!(score <= previous, "score rose from {previous} to {score}");
            previous = score;
        }
    }

    #[test]
    fn test_security_errors_weigh_more() {
        let mut plain = result(2, 1, 0);
        plain.errors = vec!["main.go:1:1: undefined: x".to_owned()];
        let mut security = result(2, 1, 0);
        security.errors = vec!["main.go:1: security violation [private_key]: embedded private key".to_owned()];

        let plain_metrics = compute_metrics(&plain);
        let security_metrics = compute_metrics(&security);
        assert!((security_metrics.weighted_errors - 3.0).abs() < f64::EPSILON);
        assert!(security_metrics.overall_score < plain_metrics.overall_score);
    }

    #[test]
    fn test_metrics_are_deterministic() {
        let mut test = result(4, 1, 2);
        test.errors = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(compute_metrics(&test), compute_metrics(&test));
    }

    #[test]
    fn test_json_report_is_written_by_test_id() -> Result<()> {
        let dir = TempDir::new()?;
        let test = result(3, 0, 0);
        let path = reporter(dir.path(), ReportFormat::Json).generate_report(&test)?;

        assert_eq!(path, dir.path().join(format!("{}.json", test.test_id)));
        let json: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(json["test_result"]["test_id"], test.test_id.to_string());
        assert_eq!(json["metrics"]["overall_score"], 100.0);
        Ok(())
    }

    #[test]
    fn test_text_report() -> Result<()> {
        let dir = TempDir::new()?;
        let mut test = result(1, 1, 0);
        test.errors = vec!["main.go:2:1: syntax error: unclosed '{'".to_owned()];
        test.recommendations = vec!["Correct the malformed source before building".to_owned()];

        let path = reporter(dir.path(), ReportFormat::Text).generate_report(&test)?;
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("txt"));
        let text = fs::read_to_string(&path)?;
        assert!(text.contains("Result:     FAILED"));
        assert!(text.contains("  - main.go:2:1: syntax error: unclosed '{'"));
        assert!(text.contains("Recommendations"));
        Ok(())
    }

    #[test]
    fn test_html_report_escapes_content() -> Result<()> {
        let dir = TempDir::new()?;
        let mut test = result(0, 1, 0);
        test.errors = vec!["<script>alert('x')</script>".to_owned()];

        let path = reporter(dir.path(), ReportFormat::Html).generate_report(&test)?;
        let html = fs::read_to_string(&path)?;
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
        Ok(())
    }

    #[test]
    fn test_batch_report() -> Result<()> {
        let dir = TempDir::new()?;
        let batch = BatchTestResult {
            request_id: "req-1".to_owned(),
            total_servers: 2,
            completed_tests: 1,
            failed_tests: 1,
            results: vec![result(3, 0, 0), result(1, 1, 1)],
            duration_ms: 42,
        };

        let path = reporter(dir.path(), ReportFormat::Text).generate_batch_report(&batch)?;
        assert_eq!(path, dir.path().join("batch-req-1.txt"));
        let text = fs::read_to_string(&path)?;
        assert!(text.contains("Failed:     1"));
        assert_eq!(text.matches("  [").count(), 2);
        Ok(())
    }

    #[test]
    fn test_batch_report_stays_inside_output_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let output = dir.path().join("reports");
        let batch = BatchTestResult {
            request_id: "../../outside/run".to_owned(),
            total_servers: 0,
            completed_tests: 0,
            failed_tests: 0,
            results: Vec::new(),
            duration_ms: 0,
        };

        let path = reporter(&output, ReportFormat::Json).generate_batch_report(&batch)?;
        assert_eq!(path, output.join("batch-______outside_run.json"));
        assert!(path.is_file());
        assert!(!dir.path().join("outside").exists());
        Ok(())
    }

    #[test]
    fn test_unwritable_output_is_report_error() -> Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory")?;

        let outcome = reporter(&blocker, ReportFormat::Json).generate_report(&result(1, 0, 0));
        assert!(matches!(outcome, Err(Error::Report(_))));
        Ok(())
    }
}
