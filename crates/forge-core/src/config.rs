//! Configuration for pipeline, batch, features, protocol, resources, reporting and toolchain.

use crate::error::{Error, Result};
use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Complete validation configuration.
///
/// Loaded and validated once per run, then shared read-only by every worker.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline execution settings
    pub pipeline: PipelineConfig,
    /// Batch scheduling settings
    pub batch: BatchConfig,
    /// Optional stage toggles
    pub features: FeatureConfig,
    /// Protocol conformance requirements
    pub protocol: ProtocolConfig,
    /// Resource ceilings for the performance probe
    pub resources: ResourceConfig,
    /// Report output settings
    pub reporting: ReportingConfig,
    /// Retry policy for transient execution errors
    pub retry: RetryConfig,
    /// Declared toolchain of the generated project
    pub toolchain: ToolchainConfig,
}

/// Pipeline execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overall timeout for one pipeline run, in seconds
    pub timeout_seconds: u64,
    /// Keep running later stages after a required stage failed
    pub continue_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            continue_on_failure: false,
        }
    }
}

/// Batch scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of pipelines running concurrently
    pub max_concurrent_workers: usize,
    /// Whether batches run in parallel by default
    pub parallel: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            parallel: false,
        }
    }
}

/// Optional stage toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Configuration struct with multiple feature flags"
)]
pub struct FeatureConfig {
    /// Run the security scanner
    pub security_scanning: bool,
    /// Run the linter
    pub linting: bool,
    /// Run the performance probe
    pub performance_testing: bool,
    /// Run the protocol conformance probe
    pub integration_testing: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            security_scanning: true,
            linting: true,
            performance_testing: false,
            integration_testing: false,
        }
    }
}

/// Protocol conformance requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol version the server must accept and echo back
    pub version: String,
    /// JSON-RPC methods the server must implement
    pub required_methods: BTreeSet<String>,
    /// Capabilities the server must advertise on initialize
    pub required_capabilities: BTreeSet<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: "2024-11-05".to_owned(),
            required_methods: ["tools/list".to_owned()].into_iter().collect(),
            required_capabilities: ["tools".to_owned()].into_iter().collect(),
        }
    }
}

/// Resource ceilings enforced by the performance probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Maximum allowed response latency in milliseconds
    pub max_response_time_ms: u64,
    /// Maximum allowed resident memory in megabytes
    pub max_memory_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_response_time_ms: 1000,
            max_memory_mb: 256,
        }
    }
}

/// Output format of generated reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Pretty-printed JSON
    #[default]
    Json,
    /// Plain text summary
    Text,
    /// Self-contained HTML page
    Html,
}

impl ReportFormat {
    /// File extension used for reports in this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Html => "html",
        })
    }
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "html" => Ok(Self::Html),
            other => Err(Error::Config(format!(
                "unsupported report format '{other}' (expected json, text or html)"
            ))),
        }
    }
}

/// Report output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Whether reports are written after a run
    pub generate_report: bool,
    /// Report format
    pub format: ReportFormat,
    /// Directory reports and diagnostics are written to
    pub output_path: PathBuf,
    /// Log verbosity used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            generate_report: true,
            format: ReportFormat::Json,
            output_path: PathBuf::from("forge-reports"),
            log_level: "info".to_owned(),
        }
    }
}

/// Retry policy for transient execution errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    pub attempts: u32,
    /// Delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Declared toolchain of the generated project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Build command argv, run inside the project directory
    pub build: Vec<String>,
    /// Optional external lint command argv
    pub lint: Vec<String>,
    /// Optional command launching the server over stdio
    pub run: Vec<String>,
    /// File extensions examined by static checks
    pub source_extensions: Vec<String>,
    /// Build descriptors, one of which must exist at the project root
    pub descriptor_files: Vec<String>,
    /// Longest line accepted by the built-in lint rules
    pub max_line_length: usize,
    /// Lint warnings tolerated before the lint stage fails
    pub max_lint_warnings: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            build: vec!["go".to_owned(), "build".to_owned(), "./...".to_owned()],
            lint: Vec::new(),
            run: Vec::new(),
            source_extensions: vec!["go".to_owned()],
            descriptor_files: vec!["go.mod".to_owned()],
            max_line_length: 120,
            max_lint_warnings: 25,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load config from a specific file and validate it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            Error::Config(format!("Failed to read config {}: {error}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: timeout={}s workers={} format={}",
            path,
            config.pipeline.timeout_seconds,
            config.batch.max_concurrent_workers,
            config.reporting.format
        );

        Ok(config)
    }

    /// Save config to a specific file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;

        let header = "# Forge validation configuration\n\
                      # Generated by `forge-check init-config`\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }

    /// Check every invariant of the configuration.
    ///
    /// Invalid values are rejected, never clamped.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.timeout_seconds == 0 {
            return Err(Error::Config(
                "pipeline.timeout_seconds must be greater than zero".to_owned(),
            ));
        }
        if self.batch.max_concurrent_workers < 1 {
            return Err(Error::Config(
                "batch.max_concurrent_workers must be at least 1".to_owned(),
            ));
        }
        if self.resources.max_response_time_ms == 0 {
            return Err(Error::Config(
                "resources.max_response_time_ms must be greater than zero".to_owned(),
            ));
        }
        if self.resources.max_memory_mb == 0 {
            return Err(Error::Config(
                "resources.max_memory_mb must be greater than zero".to_owned(),
            ));
        }
        if self
            .toolchain
            .build
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(Error::Config(
                "toolchain.build must name a build command".to_owned(),
            ));
        }
        if self.toolchain.source_extensions.is_empty() {
            return Err(Error::Config(
                "toolchain.source_extensions must not be empty".to_owned(),
            ));
        }
        if self.toolchain.max_line_length == 0 {
            return Err(Error::Config(
                "toolchain.max_line_length must be greater than zero".to_owned(),
            ));
        }
        let level = self.reporting.log_level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(Error::Config(format!(
                "reporting.log_level '{}' is not one of {}",
                self.reporting.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.protocol.version.trim().is_empty() {
            return Err(Error::Config("protocol.version must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Overall pipeline timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.timeout_seconds)
    }

    /// Whether a source file with this extension is examined by static checks.
    pub fn is_source_extension(&self, extension: &str) -> bool {
        self.toolchain
            .source_extensions
            .iter()
            .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(extension))
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
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(matches!(config.validate(), Ok(())));
        assert_eq!(config.batch.max_concurrent_workers, 4);
        assert_eq!(config.reporting.format, ReportFormat::Json);
        assert!(!config.pipeline.continue_on_failure);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.pipeline.timeout_seconds = 0;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.batch.max_concurrent_workers = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = Config::default();
        config.reporting.log_level = "loud".to_owned();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_build_command_rejected() {
        let mut config = Config::default();
        config.toolchain.build = vec![String::new()];
        assert!(matches!(config.validate(), Err(_)));
    }

    #[test]
    fn test_report_format_parsing() {
        assert_eq!("json".parse::<ReportFormat>().ok(), Some(ReportFormat::Json));
        assert_eq!("HTML".parse::<ReportFormat>().ok(), Some(ReportFormat::Html));
        assert_eq!("text".parse::<ReportFormat>().ok(), Some(ReportFormat::Text));
        assert!(matches!("pdf".parse::<ReportFormat>(), Err(_)));
    }

    #[test]
    fn test_unknown_report_format_in_toml_rejected() {
        let mut file = NamedTempFile::new().expect("create temp file");
        write!(file, "[reporting]\nformat = \"xml\"\n").expect("write config");
        assert!(matches!(Config::load_from_file(file.path()), Err(_)));
    }

    #[test]
    fn test_load_partial_toml_uses_defaults() {
        let mut file = NamedTempFile::new().expect("create temp file");
        write!(
            file,
            r#"
[pipeline]
timeout_seconds = 30
continue_on_failure = true

[features]
linting = false

[protocol]
required_methods = ["tools/list", "tools/call"]

[toolchain]
build = ["cargo", "check"]
source_extensions = ["rs"]
descriptor_files = ["Cargo.toml"]
"#
        )
        .expect("write config");

        let config = Config::load_from_file(file.path()).expect("load config");
        assert_eq!(config.pipeline.timeout_seconds, 30);
        assert!(config.pipeline.continue_on_failure);
        assert!(!config.features.linting);
        assert!(config.features.security_scanning);
        assert!(config.protocol.required_methods.contains("tools/call"));
        assert_eq!(config.batch.max_concurrent_workers, 4);
        assert!(config.is_source_extension("rs"));
        assert!(!config.is_source_extension("go"));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("forge.toml");

        let mut config = Config::default();
        config.reporting.format = ReportFormat::Html;
        config.save_to_file(&path).expect("save config");

        let contents = fs::read_to_string(&path).expect("read config");
        assert!(contents.starts_with("# Forge validation configuration"));

        let reloaded = Config::load_from_file(&path).expect("reload config");
        assert_eq!(reloaded.reporting.format, ReportFormat::Html);
    }
}
