//! Validation engine for generated server projects.
//!
//! This crate provides:
//! - Stage validators (structure, build, syntax, lint, security, protocol, performance)
//! - The [`TestPipeline`] running those validators in order over one project
//! - The [`BatchRunner`] for validating many projects on a bounded worker pool
//! - Failure diagnostics and report rendering

/// Batch execution over many projects.
pub mod batch;
/// Failure classification and remediation advice.
pub mod diagnostics;
/// Peak memory sampling for probed processes.
pub mod memory;
/// Stage-ordered execution over one project.
pub mod pipeline;
/// JSON-RPC stdio probe.
pub mod probe;
/// Report rendering and quality scoring.
pub mod report;
/// Source file discovery.
pub mod source;
/// Toolchain command execution.
pub mod toolchain;
/// Stage validators and their registry.
pub mod validator;

pub use batch::{BatchRunner, DiagnosedBatch};
pub use diagnostics::{
    DiagnosticReport, DiagnosticsEngine, FailureAnalysis, FailureType, TroubleshootingStep,
    save_diagnostic_report,
};
pub use pipeline::{PipelineStatus, TestPipeline};
pub use report::{Reporter, TestMetrics, compute_metrics, diagnostics_path};
pub use validator::{STANDARD_STAGES, Validator, ValidatorRegistry};
