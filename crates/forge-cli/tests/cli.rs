//! End-to-end CLI tests using `assert_cmd`
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to get cargo binary or fail test
fn cargo_bin() -> Command {
    Command::cargo_bin("forge-check").unwrap_or_else(|err| panic!("Binary not found: {err}"))
}

/// Helper to create temp dir or fail test
fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("Failed to create temp dir: {err}"))
}

fn write_project(root: &Path, name: &str, main: &str) -> PathBuf {
    let path = root.join(name);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("go.mod"), format!("module example.com/{name}\n")).unwrap();
    fs::write(path.join("main.go"), main).unwrap();
    path
}

/// Config whose build step always succeeds.
fn write_config(root: &Path) -> PathBuf {
    let path = root.join("forge.toml");
    fs::write(
        &path,
        format!(
            "[features]\nlinting = false\n\n[reporting]\nformat = \"json\"\noutput_path = {:?}\n\n[toolchain]\nbuild = [\"sh\", \"-c\", \"true\"]\n",
            root.join("reports").to_string_lossy()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    cargo_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_cli_invalid_command() {
    cargo_bin().arg("invalid-command-xyz").assert().failure();
}

#[test]
fn test_init_then_check_config() {
    let temp = temp_dir();
    let path = temp.path().join("forge.toml");

    cargo_bin()
        .arg("init-config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));
    assert!(path.exists());

    cargo_bin()
        .arg("check-config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));

    cargo_bin().arg("init-config").arg(&path).assert().failure();
}

#[test]
fn test_check_config_rejects_invalid_values() {
    let temp = temp_dir();
    let path = temp.path().join("forge.toml");
    fs::write(&path, "[pipeline]\ntimeout_seconds = 0\n").unwrap();

    cargo_bin()
        .arg("check-config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout_seconds"));
}

#[cfg(unix)]
#[test]
fn test_validate_passing_project() {
    let temp = temp_dir();
    let config = write_config(temp.path());
    let project = write_project(
        temp.path(),
        "valid",
        "package main\n\nfunc main() {\n\tprintln(\"ok\")\n}\n",
    );

    cargo_bin()
        .arg("validate")
        .arg(&project)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("[PASSED]"))
        .stdout(predicate::str::contains("1 passed, 0 failed, 1 total"));

    let reports = fs::read_dir(temp.path().join("reports")).unwrap().count();
    assert_eq!(reports, 1);
}

#[cfg(unix)]
#[test]
fn test_validate_failing_project_writes_diagnostics() {
    let temp = temp_dir();
    let config = write_config(temp.path());
    let valid = write_project(
        temp.path(),
        "valid",
        "package main\n\nfunc main() {\n\tprintln(\"ok\")\n}\n",
    );
    let invalid = write_project(temp.path(), "invalid", "package main\n\nfunc main() {\n");

    cargo_bin()
        .arg("validate")
        .arg(&valid)
        .arg(&invalid)
        .arg("--config")
        .arg(&config)
        .arg("--parallel")
        .assert()
        .failure()
        .stdout(predicate::str::contains("[FAILED]"))
        .stdout(predicate::str::contains("syntax error"))
        .stdout(predicate::str::contains("1 passed, 1 failed, 2 total"));

    let diagnostics: Vec<_> = fs::read_dir(temp.path().join("reports"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".diagnostics.json"))
        .collect();
    assert_eq!(diagnostics.len(), 1);
    let contents = fs::read_to_string(diagnostics[0].path()).unwrap();
    assert!(contents.contains("syntax_error"));
}
