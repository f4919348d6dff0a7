//! Line-delimited JSON-RPC client for probing a generated server over stdio.
//!
//! A server that misbehaves (closes its output, never answers, answers with
//! garbage) is a domain failure and surfaces as a [`ProbeReply`] variant. Only
//! cancellation, the run deadline and local I/O faults are returned as errors.

use crate::toolchain::spawn_error;
use core::time::Duration;
use forge_core::{Error, ProtocolConfig, ResourceConfig, Result, RunContext};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Lower bound on how long a single request may wait for its response.
const MIN_RESPONSE_WAIT: Duration = Duration::from_secs(2);

/// Outcome of one request sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeReply {
    /// The server answered with a result
    Result(Value),
    /// The server answered with a JSON-RPC error
    RpcError {
        /// Error code
        code: i64,
        /// Error message
        message: String,
    },
    /// The server closed its output before answering
    Closed,
    /// The server did not answer in time
    NoResponse,
}

impl ProbeReply {
    /// Short human-readable description used in findings.
    pub fn describe(&self) -> String {
        match self {
            Self::Result(_) => "result".to_owned(),
            Self::RpcError { code, message } => format!("error {code}: {message}"),
            Self::Closed => "server closed its output".to_owned(),
            Self::NoResponse => "no response".to_owned(),
        }
    }
}

/// A running server under probe.
pub struct StdioProbe {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioProbe {
    /// Launch the server described by `argv` inside `cwd`.
    ///
    /// # Errors
    /// Returns `Error::ToolchainMissing` or `Error::Spawn` when the server cannot start.
    pub fn launch(argv: &[String], cwd: &Path) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("empty run command".to_owned()))?;

        tracing::debug!("Launching server {:?} in {}", argv, cwd.display());

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| spawn_error(program, source))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Other("server stdin unavailable".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("server stdout unavailable".to_owned()))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    /// Process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send a request and wait up to `wait` for its response.
    ///
    /// # Errors
    /// Returns `Error::Canceled`/`Error::Timeout` when the run is interrupted,
    /// or an I/O error other than a broken pipe.
    pub async fn request(
        &mut self,
        ctx: &RunContext,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<ProbeReply> {
        let id = self.next_id;
        self.next_id += 1;

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if !self.send(&message).await? {
            return Ok(ProbeReply::Closed);
        }

        let stdout = &mut self.stdout;
        ctx.guard(async move {
            match timeout(wait, read_response(stdout, id)).await {
                Ok(reply) => reply,
                Err(_) => Ok(ProbeReply::NoResponse),
            }
        })
        .await
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    /// Returns an I/O error other than a broken pipe.
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send(&message).await.map(|_| ())
    }

    /// Stop the server and reap it.
    pub async fn shutdown(mut self) {
        if let Err(error) = self.child.start_kill() {
            tracing::debug!("Server already exited: {error}");
        }
        if let Err(error) = self.child.wait().await {
            tracing::warn!("Failed to reap probed server: {error}");
        }
    }

    /// Write one message; `Ok(false)` when the server is gone.
    async fn send(&mut self, message: &Value) -> Result<bool> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let written = async {
            self.stdin.write_all(&line).await?;
            self.stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::BrokenPipe => Ok(false),
            Err(error) => Err(Error::Io(error)),
        }
    }
}

async fn read_response(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    id: u64,
) -> Result<ProbeReply> {
    while let Some(line) = stdout.next_line().await? {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            // Servers may log to stdout; anything that is not JSON is ignored.
            continue;
        };
        if value.get("id").and_then(Value::as_u64) != Some(id) {
            continue;
        }
        if let Some(error) = value.get("error") {
            return Ok(ProbeReply::RpcError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        return Ok(ProbeReply::Result(
            value.get("result").cloned().unwrap_or(Value::Null),
        ));
    }
    Ok(ProbeReply::Closed)
}

/// How long one request waits before the server counts as unresponsive.
///
/// Several times the latency ceiling, so a slow answer can still be measured
/// and reported against the limit.
pub fn response_wait(resources: &ResourceConfig) -> Duration {
    Duration::from_millis(resources.max_response_time_ms.saturating_mul(5)).max(MIN_RESPONSE_WAIT)
}

/// Parameters of the `initialize` request for the configured protocol.
pub fn initialize_params(protocol: &ProtocolConfig) -> Value {
    json!({
        "protocolVersion": protocol.version,
        "capabilities": {},
        "clientInfo": {
            "name": "forge-check",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(all(test, unix))]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use forge_core::CancelToken;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn ctx() -> RunContext {
        RunContext::new(CancelToken::new(), Duration::from_secs(10))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[tokio::test]
    async fn test_request_reads_matching_response() {
        let dir = TempDir::new().expect("create temp dir");
        let script = r#"read line; echo "starting up"; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 5"#;
        let mut probe = StdioProbe::launch(&sh(script), dir.path()).expect("launch");

        let reply = probe
            .request(&ctx(), "ping", json!({}), Duration::from_secs(5))
            .await
            .expect("request");
        assert_eq!(reply, ProbeReply::Result(json!({ "ok": true })));
        probe.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let dir = TempDir::new().expect("create temp dir");
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}'; sleep 5"#;
        let mut probe = StdioProbe::launch(&sh(script), dir.path()).expect("launch");

        let reply = probe
            .request(&ctx(), "tools/call", json!({}), Duration::from_secs(5))
            .await
            .expect("request");
        assert!(matches!(reply, ProbeReply::RpcError { code: METHOD_NOT_FOUND, .. }));
        probe.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_server_reports_closed() {
        let dir = TempDir::new().expect("create temp dir");
        let mut probe = StdioProbe::launch(&sh("exit 0"), dir.path()).expect("launch");
        sleep(Duration::from_millis(100)).await;

        let reply = probe
            .request(&ctx(), "initialize", json!({}), Duration::from_secs(2))
            .await
            .expect("request");
        assert_eq!(reply, ProbeReply::Closed);
        probe.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_server_reports_no_response() {
        let dir = TempDir::new().expect("create temp dir");
        let mut probe = StdioProbe::launch(&sh("sleep 30"), dir.path()).expect("launch");

        let reply = probe
            .request(&ctx(), "initialize", json!({}), Duration::from_millis(150))
            .await
            .expect("request");
        assert_eq!(reply, ProbeReply::NoResponse);
        probe.shutdown().await;
    }
}
