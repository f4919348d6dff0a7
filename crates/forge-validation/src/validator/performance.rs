use super::{Validator, elapsed_ms, skipped_without_run_command};
use crate::memory::MemorySampler;
use crate::probe::{ProbeReply, StdioProbe, initialize_params, response_wait};
use async_trait::async_trait;
use core::time::Duration;
use forge_core::stage::PERFORMANCE_TESTING;
use forge_core::{Config, Result, RunContext, ValidationResult};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// How often the server's resident memory is sampled.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Launches the server and measures request latency and peak memory
/// against the configured resource ceilings.
pub struct PerformanceValidator {
    config: Arc<Config>,
}

impl PerformanceValidator {
    /// Create a performance validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Send one request and check its latency; false when the server is gone.
    async fn measure(
        &self,
        probe: &mut StdioProbe,
        ctx: &RunContext,
        method: &str,
        params: Value,
        result: &mut ValidationResult,
    ) -> Result<bool> {
        let limit = self.config.resources.max_response_time_ms;
        let wait = response_wait(&self.config.resources);

        let start = Instant::now();
        let reply = probe.request(ctx, method, params, wait).await?;
        let latency = elapsed_ms(start);

        match reply {
            ProbeReply::Result(_) | ProbeReply::RpcError { .. } => {
                tracing::debug!("{method} answered in {latency}ms");
                if latency > limit {
                    result.push_error(format!(
                        "resource limit exceeded: {method} took {latency}ms (limit {limit}ms)"
                    ));
                }
                Ok(true)
            }
            ProbeReply::NoResponse => {
                result.push_error(format!(
                    "performance: no response to {method} within {}ms",
                    wait.as_millis()
                ));
                Ok(false)
            }
            ProbeReply::Closed => {
                result.push_error(format!("performance: server exited before answering {method}"));
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Validator for PerformanceValidator {
    fn name(&self) -> &str {
        PERFORMANCE_TESTING
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        if self.config.toolchain.run.is_empty() {
            return Ok(skipped_without_run_command(PERFORMANCE_TESTING));
        }
        ctx.check()?;
        let start = Instant::now();

        let mut probe = StdioProbe::launch(&self.config.toolchain.run, project)?;
        let sampler = probe
            .pid()
            .map(|pid| MemorySampler::start(pid, SAMPLE_INTERVAL));
        let mut result = ValidationResult::passed();

        let initialized = self
            .measure(
                &mut probe,
                ctx,
                "initialize",
                initialize_params(&self.config.protocol),
                &mut result,
            )
            .await?;

        if initialized {
            probe.notify("notifications/initialized", json!({})).await?;
            for method in &self.config.protocol.required_methods {
                if !self.measure(&mut probe, ctx, method, json!({}), &mut result).await? {
                    break;
                }
            }
        }

        let peak = match sampler {
            Some(sampler) => sampler.finish_blocking().await,
            None => None,
        };
        probe.shutdown().await;

        match peak {
            Some(bytes) => {
                let peak_mb = bytes / BYTES_PER_MB;
                let limit = self.config.resources.max_memory_mb;
                tracing::debug!("Peak resident memory {peak_mb}MB (limit {limit}MB)");
                if bytes > limit.saturating_mul(BYTES_PER_MB) {
                    result.push_error(format!(
                        "resource limit exceeded: peak memory {peak_mb}MB (limit {limit}MB)"
                    ));
                }
            }
            None => result.push_warning("performance: memory usage could not be sampled"),
        }

        Ok(result.with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::validator::FAKE_SERVER;
    use forge_core::CancelToken;
    use tempfile::TempDir;

    fn config_with_server(script: &str) -> Config {
        let mut config = Config::default();
        config.toolchain.run = vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()];
        config
    }

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(20))
    }

    #[tokio::test]
    async fn test_skipped_without_run_command() -> Result<()> {
        let dir = TempDir::new()?;
        let result = PerformanceValidator::new(Arc::new(Config::default()))
            .validate(&ctx(), dir.path())
            .await?;
        assert!(result.success);
        assert!(result.warnings[0].contains("skipped"));
        Ok(())
    }

    #[tokio::test]
    async fn test_responsive_server_passes() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = config_with_server(FAKE_SERVER);
        config.resources.max_response_time_ms = 5_000;

        let result = PerformanceValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await?;
        assert!(result.success, "{:?}", result.errors);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_enforced() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = config_with_server(FAKE_SERVER);
        config.resources.max_response_time_ms = 5_000;
        config.resources.max_memory_mb = 0;

        let result = PerformanceValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await?;
        assert!(!result.success);
        assert!(
            result
                .errors
                .iter()
                .any(|error| error.starts_with("resource limit exceeded: peak memory"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_exited_server_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let config = config_with_server("exit 0");

        let result = PerformanceValidator::new(Arc::new(config))
            .validate(&ctx(), dir.path())
            .await?;
        assert!(!result.success);
        Ok(())
    }
}
