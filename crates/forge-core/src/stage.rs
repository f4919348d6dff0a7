//! Stage identifiers and the ordered stage plan derived from configuration.

use crate::config::Config;
use serde::{Deserialize, Serialize};

/// Structural checks on the project directory.
pub const PRE_VALIDATION: &str = "pre_validation";
/// Native toolchain build.
pub const COMPILATION_VALIDATION: &str = "compilation_validation";
/// Toolchain-independent static syntax check.
pub const SYNTAX_VALIDATION: &str = "syntax_validation";
/// Pattern-based security scan.
pub const SECURITY_SCANNING: &str = "security_scanning";
/// Style and lint checks.
pub const LINTING: &str = "linting";
/// Latency and memory probe against a running server.
pub const PERFORMANCE_TESTING: &str = "performance_testing";
/// Protocol conformance probe against a running server.
pub const INTEGRATION_TESTING: &str = "integration_testing";

/// One planned stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage identifier, also the registry key of its validator
    pub name: String,
    /// Whether failure of this stage decides overall success
    pub required: bool,
}

impl StageSpec {
    /// Create a stage spec.
    pub fn new(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
        }
    }
}

/// Ordered list of stages a pipeline executes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    stages: Vec<StageSpec>,
}

impl StagePlan {
    /// Build the standard plan from configuration.
    ///
    /// `pre_validation`, `compilation_validation` and `syntax_validation`
    /// always run first and are required; the optional stages follow in
    /// fixed order when their toggle is enabled and are then required too.
    pub fn from_config(config: &Config) -> Self {
        let mut stages = vec![
            StageSpec::new(PRE_VALIDATION, true),
            StageSpec::new(COMPILATION_VALIDATION, true),
            StageSpec::new(SYNTAX_VALIDATION, true),
        ];

        let optional = [
            (SECURITY_SCANNING, config.features.security_scanning),
            (LINTING, config.features.linting),
            (PERFORMANCE_TESTING, config.features.performance_testing),
            (INTEGRATION_TESTING, config.features.integration_testing),
        ];
        stages.extend(
            optional
                .into_iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(name, _)| StageSpec::new(name, true)),
        );

        Self { stages }
    }

    /// Append an extra stage after the standard ones.
    pub fn push(&mut self, spec: StageSpec) {
        self.stages.retain(|existing| existing.name != spec.name);
        self.stages.push(spec);
    }

    /// Planned stages in execution order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Number of planned stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the plan has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(plan: &StagePlan) -> Vec<&str> {
        plan.stages().iter().map(|spec| spec.name.as_str()).collect()
    }

    #[test]
    fn test_all_features_enabled_yields_seven_stages() {
        let mut config = Config::default();
        config.features.security_scanning = true;
        config.features.linting = true;
        config.features.performance_testing = true;
        config.features.integration_testing = true;

        let plan = StagePlan::from_config(&config);
        assert_eq!(
            names(&plan),
            vec![
                PRE_VALIDATION,
                COMPILATION_VALIDATION,
                SYNTAX_VALIDATION,
                SECURITY_SCANNING,
                LINTING,
                PERFORMANCE_TESTING,
                INTEGRATION_TESTING,
            ]
        );
        assert!(plan.stages().iter().all(|spec| spec.required));
    }

    #[test]
    fn test_disabled_features_are_not_planned() {
        let mut config = Config::default();
        config.features.security_scanning = false;
        config.features.linting = false;
        config.features.performance_testing = false;
        config.features.integration_testing = false;

        let plan = StagePlan::from_config(&config);
        assert_eq!(
            names(&plan),
            vec![PRE_VALIDATION, COMPILATION_VALIDATION, SYNTAX_VALIDATION]
        );
    }

    #[test]
    fn test_push_replaces_same_name() {
        let mut plan = StagePlan::default();
        plan.push(StageSpec::new("custom", true));
        plan.push(StageSpec::new("custom", false));
        assert_eq!(plan.len(), 1);
        assert!(!plan.stages()[0].required);
    }
}
