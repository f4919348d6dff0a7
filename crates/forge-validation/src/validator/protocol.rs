use super::{Validator, elapsed_ms, skipped_without_run_command};
use crate::probe::{METHOD_NOT_FOUND, ProbeReply, StdioProbe, initialize_params, response_wait};
use async_trait::async_trait;
use forge_core::stage::INTEGRATION_TESTING;
use forge_core::{Config, ProtocolConfig, Result, RunContext, ValidationResult};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Launches the server and checks that it speaks the configured protocol:
/// the `initialize` handshake, the negotiated version, the advertised
/// capabilities and every required method.
pub struct ProtocolValidator {
    config: Arc<Config>,
}

impl ProtocolValidator {
    /// Create a protocol conformance validator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

/// Check an `initialize` result against the expected protocol.
fn check_handshake(protocol: &ProtocolConfig, handshake: &Value, result: &mut ValidationResult) {
    match handshake.get("protocolVersion").and_then(Value::as_str) {
        Some(version) if version == protocol.version => {}
        Some(version) => result.push_error(format!(
            "protocol nonconformance: server negotiated protocol version {version}, expected {}",
            protocol.version
        )),
        None => result.push_error(
            "protocol nonconformance: initialize result is missing protocolVersion",
        ),
    }

    let capabilities = handshake.get("capabilities").and_then(Value::as_object);
    for capability in &protocol.required_capabilities {
        if !capabilities.is_some_and(|advertised| advertised.contains_key(capability)) {
            result.push_error(format!(
                "protocol nonconformance: missing capability '{capability}'"
            ));
        }
    }

    if handshake.get("serverInfo").is_none() {
        result.push_warning("protocol: initialize result has no serverInfo");
    }
}

#[async_trait]
impl Validator for ProtocolValidator {
    fn name(&self) -> &str {
        INTEGRATION_TESTING
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &RunContext, project: &Path) -> Result<ValidationResult> {
        if self.config.toolchain.run.is_empty() {
            return Ok(skipped_without_run_command(INTEGRATION_TESTING));
        }
        ctx.check()?;
        let start = Instant::now();
        let protocol = &self.config.protocol;
        let wait = response_wait(&self.config.resources);

        let mut probe = StdioProbe::launch(&self.config.toolchain.run, project)?;
        let mut result = ValidationResult::passed();

        let reply = probe
            .request(ctx, "initialize", initialize_params(protocol), wait)
            .await?;

        let handshake = match reply {
            ProbeReply::Result(handshake) => Some(handshake),
            ProbeReply::RpcError { .. } => {
                result.push_error(format!(
                    "protocol nonconformance: initialize rejected ({})",
                    reply.describe()
                ));
                None
            }
            ProbeReply::NoResponse | ProbeReply::Closed => {
                result.push_error(format!(
                    "protocol nonconformance: initialize failed ({})",
                    reply.describe()
                ));
                None
            }
        };

        if let Some(handshake) = handshake {
            check_handshake(protocol, &handshake, &mut result);
            probe.notify("notifications/initialized", json!({})).await?;

            for method in &protocol.required_methods {
                match probe.request(ctx, method, json!({}), wait).await? {
                    ProbeReply::Result(_) => {}
                    ProbeReply::RpcError { code, .. } if code == METHOD_NOT_FOUND => {
                        result.push_error(format!(
                            "protocol nonconformance: method not found: {method}"
                        ));
                    }
                    reply @ ProbeReply::RpcError { .. } => {
                        result.push_warning(format!(
                            "protocol: {method} returned {}",
                            reply.describe()
                        ));
                    }
                    reply @ (ProbeReply::NoResponse | ProbeReply::Closed) => {
                        result.push_error(format!(
                            "protocol nonconformance: {method} failed ({})",
                            reply.describe()
                        ));
                        break;
                    }
                }
            }
        }

        probe.shutdown().await;
        tracing::debug!(
            "Protocol probe of {} finished with {} errors",
            project.display(),
            result.errors.len()
        );

        Ok(result.with_duration_ms(elapsed_ms(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> ProtocolConfig {
        ProtocolConfig::default()
    }

    #[test]
    fn test_conforming_handshake() {
        let mut result = ValidationResult::passed();
        let handshake = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "demo" },
        });
        check_handshake(&protocol(), &handshake, &mut result);
        assert!(result.success);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_version_and_capability_mismatch() {
        let mut result = ValidationResult::passed();
        let handshake = json!({ "protocolVersion": "2023-01-01", "capabilities": {} });
        check_handshake(&protocol(), &handshake, &mut result);

        assert_eq!(
            result.errors,
            vec![
                "protocol nonconformance: server negotiated protocol version 2023-01-01, expected 2024-11-05".to_owned(),
                "protocol nonconformance: missing capability 'tools'".to_owned(),
            ]
        );
        assert_eq!(result.warnings.len(), 1);
    }

    #[cfg(unix)]
    mod probe {
        use super::*;
        use crate::validator::FAKE_SERVER;
        use core::time::Duration;
        use forge_core::CancelToken;
        use tempfile::TempDir;

        fn config(script: &str, methods: &[&str]) -> Arc<Config> {
            let mut config = Config::default();
            config.toolchain.run = vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()];
            config.protocol.required_methods = methods.iter().map(|&method| method.to_owned()).collect();
            Arc::new(config)
        }

        fn ctx() -> RunContext {
            RunContext::new(CancelToken::new(), Duration::from_secs(20))
        }

        #[tokio::test]
        async fn test_conforming_server_passes() -> Result<()> {
            let dir = TempDir::new()?;
            let result = ProtocolValidator::new(config(FAKE_SERVER, &["tools/list"]))
                .validate(&ctx(), dir.path())
                .await?;
            assert!(result.success, "{:?}", result.errors);
            Ok(())
        }

        #[tokio::test]
        async fn test_missing_method_fails() -> Result<()> {
            let dir = TempDir::new()?;
            let result = ProtocolValidator::new(config(FAKE_SERVER, &["tools/list", "tools/call"]))
                .validate(&ctx(), dir.path())
                .await?;
            assert!(!result.success);
            assert_eq!(
                result.errors,
                vec!["protocol nonconformance: method not found: tools/call".to_owned()]
            );
            Ok(())
        }

        #[tokio::test]
        async fn test_silent_server_fails() -> Result<()> {
            let dir = TempDir::new()?;
            let result = ProtocolValidator::new(config("exit 0", &[]))
                .validate(&ctx(), dir.path())
                .await?;
            assert!(!result.success);
            assert!(result.errors[0].starts_with("protocol nonconformance: initialize failed"));
            Ok(())
        }
    }
}
