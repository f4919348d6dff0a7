//! Shared fixtures for forge-validation integration tests.

use core::time::Duration;
use forge_core::{CancelToken, Config, RunContext};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Well-formed server entry point.
pub const VALID_MAIN: &str = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"ready\")\n}\n";

/// Entry point with an unclosed function body.
pub const INVALID_MAIN: &str = "package main\n\nfunc main() {\n\tfmt.Println(\"ready\")\n";

/// Temporary workspace holding generated projects.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create an empty workspace.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("Failed to create temp dir: {err}"));
        Self { dir }
    }

    /// Root of the workspace.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a project named `name` with a `go.mod` and the given `main.go`.
    pub fn project(&self, name: &str, main: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path).unwrap_or_else(|err| panic!("Failed to create project: {err}"));
        fs::write(path.join("go.mod"), format!("module example.com/{name}\n\ngo 1.22\n"))
            .unwrap_or_else(|err| panic!("Failed to write go.mod: {err}"));
        fs::write(path.join("main.go"), main)
            .unwrap_or_else(|err| panic!("Failed to write main.go: {err}"));
        path
    }
}

/// Config whose build step always succeeds, leaving failures to the static checks.
pub fn config() -> Config {
    let mut config = Config::default();
    config.toolchain.build = vec!["sh".to_owned(), "-c".to_owned(), "true".to_owned()];
    config.features.linting = false;
    config.retry.delay_ms = 10;
    config.reporting.generate_report = false;
    config
}

/// Shared form of [`config`].
pub fn shared_config() -> Arc<Config> {
    Arc::new(config())
}

/// Fresh run-context with a generous deadline.
pub fn ctx() -> RunContext {
    RunContext::new(CancelToken::new(), Duration::from_secs(30))
}
