//! Running declared toolchain commands against a project directory.

use forge_core::{Error, Result, RunContext};
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Captured output of a toolchain command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the command exited with status zero
    pub success: bool,
    /// Exit code, absent when terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Standard output followed by standard error, line by line.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }
}

/// Map a spawn failure to the matching execution error.
pub(crate) fn spawn_error(program: &str, source: IoError) -> Error {
    if source.kind() == ErrorKind::NotFound {
        Error::ToolchainMissing(program.to_owned())
    } else {
        Error::Spawn {
            program: program.to_owned(),
            source,
        }
    }
}

/// Run `argv` inside `cwd`, bounded by the run's deadline and cancel token.
///
/// The child is spawned with `kill_on_drop`, so a canceled or timed-out run
/// kills the process instead of leaving it behind.
///
/// # Errors
/// Returns `Error::ToolchainMissing` when the program does not exist,
/// `Error::Spawn` when it cannot be started, and `Error::Canceled` /
/// `Error::Timeout` when the run is interrupted.
pub async fn run_command(argv: &[String], cwd: &Path, ctx: &RunContext) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Config("empty toolchain command".to_owned()))?;

    ctx.check()?;
    tracing::debug!("Running {:?} in {}", argv, cwd.display());

    let start = Instant::now();
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| spawn_error(program, source))?;

    let output = ctx
        .guard(async { child.wait_with_output().await.map_err(Error::from) })
        .await?;

    let duration_ms = start.elapsed().as_millis() as u64;
    let exit_code = output.status.code();

    tracing::debug!(
        "Command {} finished with exit code {:?} in {}ms",
        program,
        exit_code,
        duration_ms
    );

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms,
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
    use core::time::Duration;
    use forge_core::CancelToken;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    #[tokio::test]
    async fn test_captures_output_and_status() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = RunContext::new(CancelToken::new(), Duration::from_secs(10));

        let output = run_command(&sh("echo out; echo err >&2; exit 3"), dir.path(), &ctx)
            .await
            .expect("command runs");

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_program_is_toolchain_error() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = RunContext::new(CancelToken::new(), Duration::from_secs(10));
        let argv = vec!["forge-definitely-not-a-real-binary".to_owned()];

        let error = run_command(&argv, dir.path(), &ctx).await.unwrap_err();
        assert!(matches!(error, Error::ToolchainMissing(_)));
    }

    #[tokio::test]
    async fn test_deadline_kills_long_running_command() {
        let dir = TempDir::new().expect("create temp dir");
        let ctx = RunContext::new(CancelToken::new(), Duration::from_millis(200));
        let start = Instant::now();

        let error = run_command(&sh("sleep 30"), dir.path(), &ctx).await.unwrap_err();
        assert!(matches!(error, Error::Timeout(200)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_aborts_command() {
        let dir = TempDir::new().expect("create temp dir");
        let token = CancelToken::new();
        let ctx = RunContext::new(token.clone(), Duration::from_secs(30));

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let error = run_command(&sh("sleep 30"), dir.path(), &ctx).await.unwrap_err();
        assert!(matches!(error, Error::Canceled));
        canceller.await.expect("join canceller");
    }
}
