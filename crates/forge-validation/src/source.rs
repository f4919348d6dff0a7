//! Source discovery shared by the static validators.

use forge_core::{Config, Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use walkdir::{DirEntry, WalkDir};

/// Directories never examined: build output, dependency caches and VCS metadata.
const SKIPPED_DIRS: [&str; 7] = [
    "target",
    "node_modules",
    "vendor",
    ".git",
    ".idea",
    ".vscode",
    "dist",
];

/// A source file loaded for static analysis.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the project root
    pub relative: PathBuf,
    /// File contents (lossy UTF-8)
    pub contents: String,
}

impl SourceFile {
    /// Display form of the relative path, used in finding messages.
    pub fn display(&self) -> String {
        self.relative.display().to_string()
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Collect every source file below `root` whose extension is declared in the config.
///
/// Paths are returned sorted so findings are reported deterministically.
///
/// # Errors
/// Returns an error if the directory tree cannot be walked.
pub fn collect_source_files(root: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).into_iter().filter_entry(|entry| !is_skipped(entry)) {
        let entry = entry.map_err(|error| Error::Other(format!("Failed to walk {}: {error}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| config.is_source_extension(extension));
        if matches {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Load every declared source file below `root`.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub fn load_sources(root: &Path, config: &Config) -> Result<Vec<SourceFile>> {
    collect_source_files(root, config)?
        .into_iter()
        .map(|path| -> Result<SourceFile> {
            let bytes = fs::read(&path)?;
            let relative = path.strip_prefix(root).map_or_else(|_| path.clone(), Path::to_path_buf);
            Ok(SourceFile {
                relative,
                contents: String::from_utf8_lossy(&bytes).into_owned(),
            })
        })
        .collect()
}

/// Load sources on the blocking pool so directory walks never stall the runtime.
///
/// # Errors
/// Returns an error if loading fails or the blocking task panics.
pub async fn load_sources_blocking(root: &Path, config: &Config) -> Result<Vec<SourceFile>> {
    on_blocking_pool(root, config, load_sources).await
}

/// [`collect_source_files`] on the blocking pool.
///
/// # Errors
/// Returns an error if the walk fails or the blocking task panics.
pub async fn collect_source_files_blocking(root: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    on_blocking_pool(root, config, collect_source_files).await
}

async fn on_blocking_pool<T, F>(root: &Path, config: &Config, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Path, &Config) -> Result<T> + Send + 'static,
{
    let root = root.to_path_buf();
    let config = config.clone();
    spawn_blocking(move || work(&root, &config))
        .await
        .map_err(|err| Error::Other(format!("Task join failed: {err}")))?
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collects_only_declared_extensions() {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(dir.path().join("main.go"), "package main\n").expect("write");
        fs::write(dir.path().join("README.md"), "# readme\n").expect("write");
        fs::create_dir_all(dir.path().join("internal")).expect("mkdir");
        fs::write(dir.path().join("internal/tools.go"), "package internal\n").expect("write");

        let files = collect_source_files(dir.path(), &Config::default()).expect("collect");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|path| path.extension().is_some_and(|ext| ext == "go")));
    }

    #[test]
    fn test_skips_vendor_and_vcs_directories() {
        let dir = TempDir::new().expect("create temp dir");
        fs::create_dir_all(dir.path().join("vendor/lib")).expect("mkdir");
        fs::create_dir_all(dir.path().join(".git")).expect("mkdir");
        fs::write(dir.path().join("vendor/lib/dep.go"), "package lib\n").expect("write");
        fs::write(dir.path().join(".git/hook.go"), "package git\n").expect("write");
        fs::write(dir.path().join("main.go"), "package main\n").expect("write");

        let sources = load_sources(dir.path(), &Config::default()).expect("load");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].display(), "main.go");
    }

    #[tokio::test]
    async fn test_blocking_collection_matches_direct_walk() {
        let dir = TempDir::new().expect("create temp dir");
        fs::create_dir_all(dir.path().join("cmd")).expect("mkdir");
        fs::write(dir.path().join("main.go"), "package main\n").expect("write");
        fs::write(dir.path().join("cmd/run.go"), "package cmd\n").expect("write");

        let config = Config::default();
        let walked = collect_source_files(dir.path(), &config).expect("collect");
        let pooled = collect_source_files_blocking(dir.path(), &config)
            .await
            .expect("collect on pool");
        assert_eq!(pooled, walked);
        assert_eq!(pooled.len(), 2);
    }
}
