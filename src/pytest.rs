//! pytest command construction shared by discovery and verification

use crate::util::{run_command_with_timeout, CommandRunResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Exit code pytest uses when nothing was collected.
pub const EXIT_NO_TESTS: i32 = 5;

/// How to invoke pytest inside a workspace
#[derive(Debug, Clone)]
pub struct PytestCommand {
    program: String,
    extra_args: Vec<String>,
    root: PathBuf,
}

impl PytestCommand {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            program: "pytest".to_string(),
            extra_args: Vec::new(),
            root: root.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// A command with user `addopts` neutralised, so output format and
    /// fail-fast flags stay under our control.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut parts = self.program.split_whitespace();
        let program = parts.next().unwrap_or("pytest");
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .current_dir(&self.root)
            .arg("--override-ini=addopts=")
            .arg("-p")
            .arg("no:cacheprovider")
            .args(&self.extra_args)
            .args(args)
            .env("PYTHONDONTWRITEBYTECODE", "1");
        cmd
    }

    /// Runs to completion or until `timeout`, blocking the calling thread.
    pub fn run<I, S>(&self, args: I, timeout: Duration) -> Result<CommandRunResult, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.command(args);
        debug!(command = ?cmd, timeout_secs = timeout.as_secs(), "running pytest");
        run_command_with_timeout(&mut cmd, timeout)
    }

    /// Whether the program starts at all.
    pub fn is_available(&self) -> bool {
        let mut parts = self.program.split_whitespace();
        let program = parts.next().unwrap_or("pytest");
        let mut cmd = Command::new(program);
        cmd.args(parts).arg("--version").current_dir(&self.root);
        run_command_with_timeout(&mut cmd, Duration::from_secs(30))
            .map(|r| r.success())
            .unwrap_or(false)
    }
}
