//! Pre-flight checks on the workspace before a session starts

use crate::pytest::PytestCommand;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    /// Canonical workspace root
    pub root: PathBuf,
    /// Whether the root is the top of a git repository
    pub is_git: bool,
}

/// Checks that `root` is a writable directory with a working pytest.
pub fn validate(root: &Path, pytest: &PytestCommand) -> Result<WorkspaceInfo> {
    let root = check_directory(root)?;

    let is_git = git2::Repository::open(&root).is_ok();
    if !is_git {
        warn!(
            root = %root.display(),
            "workspace is not a git repository; fixes will not be branched or committed"
        );
    }

    if !pytest.is_available() {
        anyhow::bail!(
            "could not run '{} --version' in {}; install pytest or set pytest_program in .branch-fixer.toml",
            pytest.program(),
            root.display()
        );
    }

    Ok(WorkspaceInfo { root, is_git })
}

fn check_directory(root: &Path) -> Result<PathBuf> {
    let metadata = fs::metadata(root)
        .with_context(|| format!("workspace {} does not exist", root.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("workspace {} is not a directory", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", root.display()))?;

    let scratch = root.join(format!(".branch-fixer-write-check-{}", std::process::id()));
    fs::write(&scratch, b"")
        .with_context(|| format!("workspace {} is not writable", root.display()))?;
    if let Err(e) = fs::remove_file(&scratch) {
        debug!("could not remove write check {}: {}", scratch.display(), e);
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = check_directory(&missing).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_file_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = check_directory(&file).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_writable_root_is_left_clean() {
        let dir = TempDir::new().unwrap();
        let root = check_directory(dir.path()).unwrap();
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_pytest_fails_validation() {
        let dir = TempDir::new().unwrap();
        let pytest = PytestCommand::new(dir.path()).with_program("branch-fixer-no-such-binary");
        let err = validate(dir.path(), &pytest).unwrap_err();
        assert!(err.to_string().contains("--version"));
    }
}
