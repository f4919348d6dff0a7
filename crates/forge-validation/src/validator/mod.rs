//! Validators run by the pipeline, one per stage.
//!
//! Each validator examines a generated project and reports domain findings as
//! a [`ValidationResult`]. Returning `Err` is reserved for execution failures:
//! a missing toolchain, an I/O fault, cancellation or the run deadline.

/// Native toolchain build
pub mod build;
/// Built-in or external lint checks
pub mod lint;
/// Latency and memory probe
pub mod performance;
/// Structural project checks
pub mod pre;
/// JSON-RPC protocol conformance probe
pub mod protocol;
/// Pattern-based security scan
pub mod security;
/// Delimiter balance scan
pub mod syntax;

use async_trait::async_trait;
use core::fmt;
use forge_core::stage::{
    COMPILATION_VALIDATION, INTEGRATION_TESTING, LINTING, PERFORMANCE_TESTING, PRE_VALIDATION,
    SECURITY_SCANNING, SYNTAX_VALIDATION,
};
use forge_core::{Config, Result, RunContext, ValidationResult};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub use build::BuildValidator;
pub use lint::LintValidator;
pub use performance::PerformanceValidator;
pub use pre::PreValidator;
pub use protocol::ProtocolValidator;
pub use security::SecurityValidator;
pub use syntax::SyntaxValidator;

/// A single check applied to a generated project.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Stable stage identifier, also the registry key.
    fn name(&self) -> &str;

    /// Whether the validator suspends on subprocess or probe I/O.
    ///
    /// The pipeline runs async-capable validators on their own task so a
    /// cancellation can abort them; synchronous ones are awaited inline.
    fn supports_async(&self) -> bool;

    /// Validate the project at `project`.
    ///
    /// # Errors
    /// Returns an error only when the check could not be carried out.
    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult>;
}

/// Validators keyed by stage name.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the seven standard validators.
    pub fn standard(config: &Arc<Config>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PreValidator::new(Arc::clone(config))));
        registry.register(Arc::new(BuildValidator::new(Arc::clone(config))));
        registry.register(Arc::new(SyntaxValidator::new(Arc::clone(config))));
        registry.register(Arc::new(SecurityValidator::new(Arc::clone(config))));
        registry.register(Arc::new(LintValidator::new(Arc::clone(config))));
        registry.register(Arc::new(PerformanceValidator::new(Arc::clone(config))));
        registry.register(Arc::new(ProtocolValidator::new(Arc::clone(config))));
        registry
    }

    /// Add a validator, replacing any registered under the same name.
    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        self.validators
            .insert(validator.name().to_owned(), validator);
    }

    /// Look up the validator for a stage.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(name).map(Arc::clone)
    }

    /// Whether a validator is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Number of registered validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        names.sort_unstable();
        formatter
            .debug_struct("ValidatorRegistry")
            .field("validators", &names)
            .finish()
    }
}

/// Compile a built-in pattern.
///
/// # Panics
/// Panics if the pattern is invalid; every caller passes a literal.
pub(crate) fn pattern(source: &str) -> Regex {
    match Regex::new(source) {
        Ok(regex) => regex,
        Err(err) => panic!("Built-in pattern {source:?} is invalid: {err}"),
    }
}

/// Milliseconds elapsed since `start`.
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Result for a probe stage that cannot run because no run command is declared.
pub(crate) fn skipped_without_run_command(stage: &str) -> ValidationResult {
    let mut result = ValidationResult::passed();
    result.push_warning(format!("{stage} skipped: no run command declared in [toolchain]"));
    result
}

/// Line-delimited JSON-RPC server written in `sh` for probe tests.
///
/// Answers `initialize` and `tools/list`; every other method gets "method not found".
#[cfg(all(test, unix))]
pub(crate) const FAKE_SERVER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake"}}}\n' "$id" ;;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done"#;

/// Stage names of the standard validators, in plan order.
pub const STANDARD_STAGES: [&str; 7] = [
    PRE_VALIDATION,
    COMPILATION_VALIDATION,
    SYNTAX_VALIDATION,
    SECURITY_SCANNING,
    LINTING,
    PERFORMANCE_TESTING,
    INTEGRATION_TESTING,
];

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Validator for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn supports_async(&self) -> bool {
            false
        }

        async fn validate(&self, _ctx: &RunContext, _project: &Path) -> Result<ValidationResult> {
            Ok(ValidationResult::passed())
        }
    }

    #[test]
    fn test_standard_registry_covers_every_stage() {
        let registry = ValidatorRegistry::standard(&Arc::new(Config::default()));
        assert_eq!(registry.len(), STANDARD_STAGES.len());
        for stage in STANDARD_STAGES {
            let validator = registry.get(stage);
            assert!(validator.is_some(), "missing validator for {stage}");
            assert_eq!(validator.map(|found| found.name().to_owned()).as_deref(), Some(stage));
        }
    }

    #[test]
    fn test_register_replaces_by_name() {
        let mut registry = ValidatorRegistry::standard(&Arc::new(Config::default()));
        registry.register(Arc::new(Named(LINTING)));
        registry.register(Arc::new(Named("license_check")));

        assert_eq!(registry.len(), STANDARD_STAGES.len() + 1);
        assert!(registry.contains("license_check"));
        assert!(registry.get(LINTING).is_some_and(|found| !found.supports_async()));
    }
}
