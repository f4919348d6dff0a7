//! Failure classification and remediation guidance.
//!
//! Classification is pattern-based over the collected error strings and
//! evaluated in a fixed priority order; `unknown` is the fallback so a
//! report is always produced.

use crate::validator::pattern;
use chrono::{DateTime, Utc};
use core::fmt;
use forge_core::{Config, PipelineResult, Result, TestResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

/// Closed set of failure categories, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The native build failed
    CompilationError,
    /// A source file is structurally malformed
    SyntaxError,
    /// A security rule was violated
    SecurityViolation,
    /// The run or a probe ran out of time
    Timeout,
    /// A resource ceiling was exceeded
    ResourceExceeded,
    /// The server does not speak the expected protocol
    ProtocolNonconformance,
    /// Nothing recognizable
    Unknown,
}

impl FailureType {
    /// Categories in the order they are tried.
    pub const PRIORITY: [Self; 6] = [
        Self::CompilationError,
        Self::SyntaxError,
        Self::SecurityViolation,
        Self::Timeout,
        Self::ResourceExceeded,
        Self::ProtocolNonconformance,
    ];

    /// Stable identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompilationError => "compilation_error",
            Self::SyntaxError => "syntax_error",
            Self::SecurityViolation => "security_violation",
            Self::Timeout => "timeout",
            Self::ResourceExceeded => "resource_exceeded",
            Self::ProtocolNonconformance => "protocol_nonconformance",
            Self::Unknown => "unknown",
        }
    }

    /// Severity attached to this category.
    pub fn severity(self) -> Severity {
        match self {
            Self::CompilationError | Self::SyntaxError => Severity::Critical,
            Self::SecurityViolation | Self::ProtocolNonconformance => Severity::High,
            Self::Timeout | Self::ResourceExceeded => Severity::Medium,
            Self::Unknown => Severity::Low,
        }
    }

    fn matcher(self) -> Option<&'static Regex> {
        let matcher = match self {
            Self::CompilationError => &COMPILATION,
            Self::SyntaxError => &SYNTAX,
            Self::SecurityViolation => &SECURITY,
            Self::Timeout => &TIMEOUT,
            Self::ResourceExceeded => &RESOURCE,
            Self::ProtocolNonconformance => &PROTOCOL,
            Self::Unknown => return None,
        };
        Some(LazyLock::force(matcher))
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How urgently a failure needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Should be fixed
    Medium,
    /// Must be fixed before use
    High,
    /// The project cannot run at all
    Critical,
}

static COMPILATION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bundefined:|\bcannot find (package|module|symbol|value|type|crate)\b|\bno required module provides package\b|\bcould not import\b|\bcannot use\b|\b(imported|declared) and not used\b|\berror\[E\d+\]|\bbuild failed\b|\bcompilation (failed|error)\b|\bmissing go\.sum entry\b)",
    )
});
static SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(\bsyntax error\b|\bparse error\b|\bunexpected token\b|\bunterminated\b)")
});
static SECURITY: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)(\bsecurity violation\b|\binsecure\b)"));
static TIMEOUT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(\btimed out\b|\btimeout\b|\bdeadline exceeded\b|\bno response\b)")
});
static RESOURCE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)(\bresource limit exceeded\b|\bout of memory\b)"));
static PROTOCOL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bprotocol nonconformance\b|\bmethod not found\b|\bprotocol version\b|\bmissing capability\b)",
    )
});

static UNDEFINED_SYMBOL: LazyLock<Regex> = LazyLock::new(|| pattern(r"undefined: ([\w.]+)"));
static MISSING_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r#"(?:no required module provides package|cannot find (?:package|module|crate)) "?([\w./@-]+)"?"#)
});
static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"([\w./-]+\.[A-Za-z0-9]+):(\d+)(?::(\d+))?"));
static RULE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\[(\w+)\]"));
static LIMIT: LazyLock<Regex> = LazyLock::new(|| pattern(r"\(limit ([^)]+)\)"));
static METHOD: LazyLock<Regex> = LazyLock::new(|| pattern(r"method not found: (\S+)"));

/// Classification summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Category of the failure
    pub failure_type: FailureType,
    /// Severity of the category
    pub severity: Severity,
    /// Error that decided the category
    pub primary_error: Option<String>,
    /// Stages that failed
    pub failed_stages: Vec<String>,
    /// Number of distinct errors collected
    pub error_count: usize,
}

/// One remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleshootingStep {
    /// Position in the guide, starting at 1
    pub order: usize,
    /// What to do
    pub action: String,
    /// Command to run, when one applies
    pub command: Option<String>,
}

/// Structured diagnosis of a failed project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Project that was diagnosed
    pub project_path: PathBuf,
    /// Test the diagnosis belongs to
    pub test_id: Uuid,
    /// When the report was produced
    pub generated_at: DateTime<Utc>,
    /// Classification
    pub failure_analysis: FailureAnalysis,
    /// Free-text remediation advice
    pub recommendations: Vec<String>,
    /// Ordered next actions
    pub troubleshooting_guide: Vec<TroubleshootingStep>,
}

/// Classify an error set; the first category in priority order with a
/// matching error wins.
pub fn classify(errors: &[String]) -> (FailureType, Option<&String>) {
    for failure_type in FailureType::PRIORITY {
        let Some(matcher) = failure_type.matcher() else {
            continue;
        };
        if let Some(error) = errors.iter().find(|error| matcher.is_match(error)) {
            return (failure_type, Some(error));
        }
    }
    (FailureType::Unknown, errors.first())
}

fn capture<'text>(regex: &Regex, text: &'text str) -> Option<&'text str> {
    regex
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str())
}

/// Produces diagnostic reports for failed projects.
pub struct DiagnosticsEngine {
    config: Arc<Config>,
}

impl DiagnosticsEngine {
    /// Create an engine; the config supplies toolchain commands for the guide.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Diagnose a project from its test result and, when available, its pipeline result.
    pub fn analyze_failures(
        &self,
        project: &Path,
        test_result: &TestResult,
        pipeline: Option<&PipelineResult>,
    ) -> DiagnosticReport {
        let errors = collect_errors(test_result, pipeline);
        let (failure_type, primary) = classify(&errors);
        let primary_error = primary.cloned();

        let failed_stages = pipeline
            .map(|result| {
                result
                    .failed_stages()
                    .into_iter()
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let recommendations = self.recommendations(failure_type, primary_error.as_deref(), &errors);
        let troubleshooting_guide = self.guide(failure_type, project);

        tracing::debug!(
            "Classified failure of {} as {failure_type} from {} errors",
            project.display(),
            errors.len()
        );

        DiagnosticReport {
            project_path: project.to_path_buf(),
            test_id: test_result.test_id,
            generated_at: Utc::now(),
            failure_analysis: FailureAnalysis {
                failure_type,
                severity: failure_type.severity(),
                primary_error,
                failed_stages,
                error_count: errors.len(),
            },
            recommendations,
            troubleshooting_guide,
        }
    }

    fn recommendations(
        &self,
        failure_type: FailureType,
        primary: Option<&str>,
        errors: &[String],
    ) -> Vec<String> {
        let mut advice = Vec::new();
        let detail = primary.unwrap_or_default();

        match failure_type {
            FailureType::CompilationError => {
                advice.push("Fix the build errors reported by the toolchain".to_owned());
                if let Some(symbol) = errors.iter().find_map(|error| capture(&UNDEFINED_SYMBOL, error)) {
                    advice.push(format!("Define or import the undefined symbol `{symbol}`"));
                }
                if let Some(package) = errors.iter().find_map(|error| capture(&MISSING_PACKAGE, error)) {
                    advice.push(format!(
                        "Add the missing dependency `{package}` to the build descriptor"
                    ));
                }
            }
            FailureType::SyntaxError => {
                advice.push("Correct the malformed source before building".to_owned());
            }
            FailureType::SecurityViolation => {
                let rule = capture(&RULE, detail).unwrap_or("security rule");
                advice.push(format!(
                    "Remove the code flagged by `{rule}`; load secrets and keys from the environment"
                ));
            }
            FailureType::Timeout => {
                advice.push(format!(
                    "Check for hangs or blocking startup work; the run budget is {}s (pipeline.timeout_seconds)",
                    self.config.pipeline.timeout_seconds
                ));
            }
            FailureType::ResourceExceeded => {
                let limit = capture(&LIMIT, detail).unwrap_or("the configured limit");
                advice.push(format!(
                    "Reduce latency or memory use below {limit}, or raise the ceiling in [resources]"
                ));
            }
            FailureType::ProtocolNonconformance => {
                if let Some(method) = errors.iter().find_map(|error| capture(&METHOD, error)) {
                    advice.push(format!("Implement the required method `{method}`"));
                }
                advice.push(format!(
                    "Make the server answer `initialize` with protocol version {} and the required capabilities",
                    self.config.protocol.version
                ));
            }
            FailureType::Unknown => {
                if detail.contains("Toolchain not found") {
                    advice.push(
                        "Install the declared toolchain or update [toolchain] in the configuration"
                            .to_owned(),
                    );
                } else if detail.is_empty() {
                    advice.push("No error output was captured; re-run with RUST_LOG=debug".to_owned());
                } else {
                    advice.push(format!("Investigate the reported error: {detail}"));
                }
            }
        }

        if let Some(location) = primary.and_then(|error| LOCATION.captures(error)) {
            let file = location.get(1).map_or("", |found| found.as_str());
            let line = location.get(2).map_or("", |found| found.as_str());
            advice.push(format!("Start at {file} line {line}"));
        }

        advice
    }

    fn guide(&self, failure_type: FailureType, project: &Path) -> Vec<TroubleshootingStep> {
        let toolchain = &self.config.toolchain;
        let rerun = format!("forge-check validate {}", project.display());

        let steps: Vec<(&str, Option<String>)> = match failure_type {
            FailureType::CompilationError | FailureType::SyntaxError => vec![
                ("Reproduce the build in the project directory", shell_line(&toolchain.build)),
                ("Fix the first reported error; later errors often cascade from it", None),
                ("Re-run validation", Some(rerun)),
            ],
            FailureType::SecurityViolation => vec![
                ("Review every flagged line in the report", None),
                ("Move credentials to environment variables or a secret store", None),
                ("Re-run validation", Some(rerun)),
            ],
            FailureType::Timeout => vec![
                ("Start the server manually and watch for blocking startup work", shell_line(&toolchain.run)),
                ("Raise pipeline.timeout_seconds if the project is simply large", None),
                ("Re-run validation", Some(rerun)),
            ],
            FailureType::ResourceExceeded => vec![
                ("Profile the server under a single initialize request", shell_line(&toolchain.run)),
                ("Reduce startup allocations or adjust [resources] ceilings", None),
                ("Re-run validation", Some(rerun)),
            ],
            FailureType::ProtocolNonconformance => vec![
                ("Start the server and send an initialize request by hand", shell_line(&toolchain.run)),
                ("Compare the response with the expected protocol version and capabilities", None),
                ("Register handlers for every required method", None),
                ("Re-run validation", Some(rerun)),
            ],
            FailureType::Unknown => vec![
                ("Read the full error list in the test report", None),
                ("Re-run validation with RUST_LOG=debug", Some(rerun)),
            ],
        };

        steps
            .into_iter()
            .enumerate()
            .map(|(index, (action, command))| TroubleshootingStep {
                order: index + 1,
                action: action.to_owned(),
                command,
            })
            .collect()
    }
}

fn shell_line(argv: &[String]) -> Option<String> {
    (!argv.is_empty()).then(|| argv.join(" "))
}

fn collect_errors(test_result: &TestResult, pipeline: Option<&PipelineResult>) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();
    let stage_errors = pipeline
        .into_iter()
        .flat_map(|result| result.errors.iter().chain(result.stages.iter().filter_map(|stage| stage.error.as_ref())));

    for error in test_result.errors.iter().chain(stage_errors) {
        if !errors.contains(error) {
            errors.push(error.clone());
        }
    }
    errors
}

/// Write a diagnostic report as pretty JSON, creating parent directories.
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot be written.
pub fn save_diagnostic_report(report: &DiagnosticReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json)?;
    tracing::debug!("Wrote diagnostic report to {}", path.display());
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
    use tempfile::TempDir;

    fn failed_test(errors: &[&str]) -> TestResult {
        let mut result =
            TestResult::execution_failure(Uuid::new_v4(), PathBuf::from("demo"), Utc::now(), "", 5);
        result.errors = errors.iter().map(|&error| error.to_owned()).collect();
        result
    }

    fn engine() -> DiagnosticsEngine {
        DiagnosticsEngine::new(Arc::new(Config::default()))
    }

    #[test]
    fn test_syntax_marker_classifies_as_syntax_error() {
        let result = failed_test(&["main.go:3:1: syntax error: unexpected }"]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);

        assert_eq!(report.failure_analysis.failure_type, FailureType::SyntaxError);
        assert_eq!(report.failure_analysis.severity, Severity::Critical);
        assert!(report.recommendations.iter().any(|advice| advice == "Start at main.go line 3"));
    }

    #[test]
    fn test_compilation_outranks_syntax() {
        let errors = vec![
            "main.go:9:2: syntax error: non-declaration statement".to_owned(),
            "./main.go:5:2: undefined: Handler".to_owned(),
        ];
        let (failure_type, primary) = classify(&errors);
        assert_eq!(failure_type, FailureType::CompilationError);
        assert_eq!(primary, Some(&errors[1]));
    }

    #[test]
    fn test_compilation_details_are_extracted() {
        let result = failed_test(&[
            "./main.go:5:2: undefined: Handler",
            "main.go:4:2: no required module provides package github.com/acme/sdk; to add it:",
        ]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);

        assert_eq!(report.failure_analysis.failure_type, FailureType::CompilationError);
        assert!(report.recommendations.contains(&"Define or import the undefined symbol `Handler`".to_owned()));
        assert!(report.recommendations.contains(&"Add the missing dependency `github.com/acme/sdk` to the build descriptor".to_owned()));
        assert_eq!(report.troubleshooting_guide[0].command.as_deref(), Some("go build ./..."));
    }

    #[test]
    fn test_each_category_is_recognized() {
        let cases = [
            ("client.go:4: security violation [private_key]: embedded private key", FailureType::SecurityViolation),
            ("Timeout after 300000ms", FailureType::Timeout),
            ("resource limit exceeded: peak memory 512MB (limit 256MB)", FailureType::ResourceExceeded),
            ("protocol nonconformance: method not found: tools/call", FailureType::ProtocolNonconformance),
        ];
        for (error, expected) in cases {
            let (failure_type, _) = classify(&[error.to_owned()]);
            assert_eq!(failure_type, expected, "{error}");
        }
    }

    #[test]
    fn test_unrecognized_errors_fall_back_to_unknown() {
        let result = failed_test(&["something odd happened"]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);

        assert_eq!(report.failure_analysis.failure_type, FailureType::Unknown);
        assert_eq!(report.failure_analysis.failure_type.as_str(), "unknown");
        assert!(!report.recommendations.is_empty());
        assert!(!report.troubleshooting_guide.is_empty());
    }

    #[test]
    fn test_empty_error_set_still_produces_report() {
        let result = failed_test(&[]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);
        assert_eq!(report.failure_analysis.failure_type, FailureType::Unknown);
        assert_eq!(report.failure_analysis.error_count, 0);
        assert_eq!(report.failure_analysis.primary_error, None);
    }

    #[test]
    fn test_guide_steps_are_ordered() {
        let result = failed_test(&["protocol nonconformance: missing capability 'tools'"]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);
        let orders: Vec<usize> = report.troubleshooting_guide.iter().map(|step| step.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_save_creates_parent_directories() -> Result<()> {
        let dir = TempDir::new()?;
        let result = failed_test(&["main.go:3:1: syntax error: unexpected }"]);
        let report = engine().analyze_failures(Path::new("demo"), &result, None);
        let path = dir.path().join("nested/reports/demo.diagnostics.json");

        save_diagnostic_report(&report, &path)?;
        let loaded: DiagnosticReport = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(loaded, report);
        Ok(())
    }

    #[test]
    fn test_save_failure_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory")?;
        let report = engine().analyze_failures(Path::new("demo"), &failed_test(&[]), None);

        assert!(matches!(save_diagnostic_report(&report, &blocker.join("report.json")), Err(_)));
        Ok(())
    }

    #[test]
    fn test_builtin_patterns_compile() {
        let patterns = [
            &COMPILATION,
            &SYNTAX,
            &SECURITY,
            &TIMEOUT,
            &RESOURCE,
            &PROTOCOL,
            &UNDEFINED_SYMBOL,
            &MISSING_PACKAGE,
            &LOCATION,
            &RULE,
            &LIMIT,
            &METHOD,
        ];
        for regex in patterns {
            assert!(!LazyLock::force(regex).as_str().is_empty());
        }
    }
}
