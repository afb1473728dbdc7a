//! Re-running a single failing test

use crate::model::node_id;
use crate::pytest::PytestCommand;
use crate::util::tail_chars;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Keep the tail of runner output; pytest prints the verdict last.
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub output: String,
}

impl VerificationResult {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Runs one named test. A crash or timeout is a failed run, never an error.
#[allow(async_fn_in_trait)]
pub trait TestVerifier {
    async fn run_single(
        &self,
        file_path: &Path,
        test_name: &str,
        timeout: Duration,
    ) -> VerificationResult;
}

impl<T: TestVerifier + ?Sized> TestVerifier for &T {
    async fn run_single(
        &self,
        file_path: &Path,
        test_name: &str,
        timeout: Duration,
    ) -> VerificationResult {
        (**self).run_single(file_path, test_name, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct PytestVerifier {
    pytest: PytestCommand,
}

impl PytestVerifier {
    pub fn new(pytest: PytestCommand) -> Self {
        Self { pytest }
    }
}

impl TestVerifier for PytestVerifier {
    async fn run_single(
        &self,
        file_path: &Path,
        test_name: &str,
        timeout: Duration,
    ) -> VerificationResult {
        let node = node_id(file_path, test_name);
        let pytest = self.pytest.clone();
        let args = vec!["-q".to_string(), "--tb=short".to_string(), node.clone()];

        let joined = tokio::task::spawn_blocking(move || pytest.run(args, timeout)).await;
        let run = match joined {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => return VerificationResult::failed(format!("pytest did not run: {}", e)),
            Err(e) => return VerificationResult::failed(format!("pytest task failed: {}", e)),
        };

        debug!(
            node = %node,
            exit_code = ?run.exit_code(),
            timed_out = run.timed_out,
            elapsed_ms = run.duration.as_millis() as u64,
            "verification finished"
        );

        let mut output = tail_chars(&run.combined_output(), MAX_OUTPUT_CHARS);
        if run.timed_out {
            output.push_str(&format!("\n[timed out after {}s]", timeout.as_secs()));
            return VerificationResult::failed(output);
        }
        if run.success() {
            VerificationResult::passed(output)
        } else {
            VerificationResult::failed(output)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stand-in for pytest: passes when the node id mentions `good`.
    fn fake_runner(dir: &Path, body: &str) -> String {
        let script = dir.join("fake-pytest.sh");
        fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_exit_code_decides_result() {
        let dir = TempDir::new().unwrap();
        let program = fake_runner(
            dir.path(),
            r#"for a in "$@"; do last="$a"; done
case "$last" in *good*) echo "1 passed"; exit 0;; *) echo "1 failed"; exit 1;; esac"#,
        );
        let verifier = PytestVerifier::new(PytestCommand::new(dir.path()).with_program(program));

        let ok = verifier
            .run_single(Path::new("tests/test_a.py"), "test_good", Duration::from_secs(10))
            .await;
        assert!(ok.passed);
        assert!(ok.output.contains("1 passed"));

        let bad = verifier
            .run_single(Path::new("tests/test_a.py"), "test_bad", Duration::from_secs(10))
            .await;
        assert!(!bad.passed);
        assert!(bad.output.contains("1 failed"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let program = fake_runner(dir.path(), "sleep 5\nexit 0");
        let verifier = PytestVerifier::new(PytestCommand::new(dir.path()).with_program(program));

        let result = verifier
            .run_single(Path::new("t.py"), "test_x", Duration::from_millis(200))
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_runner_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let verifier = PytestVerifier::new(
            PytestCommand::new(dir.path()).with_program("definitely-not-a-real-pytest"),
        );
        let result = verifier
            .run_single(Path::new("t.py"), "test_x", Duration::from_secs(5))
            .await;
        assert!(!result.passed);
        assert!(result.output.contains("did not run"));
    }
}
