//! Core types for the forge generation validation pipeline.
//!
//! This crate provides the configuration model, error handling, cancellation
//! primitives and the plain result data exchanged between the validation
//! pipeline, the batch runner and any downstream consumer (CLI, UI).

/// Process-wide configuration loaded once per run.
pub mod config;
/// Cancellation token and per-run deadline context.
pub mod context;
/// Error types and result definitions.
pub mod error;
/// Result data produced by validators, pipelines and batches.
pub mod results;
/// Stable stage identifiers.
pub mod stage;

pub use config::{
    BatchConfig, Config, FeatureConfig, PipelineConfig, ProtocolConfig, ReportFormat,
    ReportingConfig, ResourceConfig, RetryConfig, ToolchainConfig,
};
pub use context::{CancelToken, RunContext};
pub use error::{Error, Result};
pub use results::{
    BatchTestRequest, BatchTestResult, PipelineResult, PipelineState, StageResult, StageResults,
    TestResult, ValidationResult,
};
pub use stage::{StagePlan, StageSpec};
