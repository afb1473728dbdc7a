use super::*;
use crate::apply::{Backup, FsChangeApplier};
use crate::coordinator::CancellationFlag;
use crate::error::{ApplyError, GenerationError, RestoreError};
use crate::model::{CodeChange, ErrorDetails, FixAttempt};
use crate::retry::RetryPolicy;
use crate::verify::VerificationResult;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Appends a marker for the test it was asked about; fixable tests get the
/// marker the verifier looks for.
struct MarkerGenerator {
    root: PathBuf,
    fixable: HashSet<&'static str>,
    cancel_on_call: Option<CancellationFlag>,
}

impl FixGenerator for MarkerGenerator {
    async fn propose(
        &self,
        error: &ErrorRecord,
        _temperature: f64,
        _prior_attempts: &[FixAttempt],
    ) -> Result<CodeChange, GenerationError> {
        if let Some(flag) = &self.cancel_on_call {
            flag.cancel();
        }
        let original = fs::read_to_string(self.root.join(&error.file_path))
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;
        let marker = if self.fixable.contains(error.test_function.as_str()) {
            format!("# fixed:{}\n", error.test_function)
        } else {
            "# wrong\n".to_string()
        };
        Ok(CodeChange::new(
            original.clone(),
            format!("{}{}", original, marker),
            "append marker",
        ))
    }
}

/// Passes when the file carries the test's marker. Tracks how many
/// verifications run per file at once.
#[derive(Default)]
struct MarkerVerifier {
    root: PathBuf,
    in_flight: Mutex<HashMap<PathBuf, usize>>,
    max_per_file: Mutex<usize>,
    max_total: Mutex<usize>,
}

impl MarkerVerifier {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }
}

impl TestVerifier for MarkerVerifier {
    async fn run_single(
        &self,
        file_path: &Path,
        test_name: &str,
        _timeout: Duration,
    ) -> VerificationResult {
        let key = self
            .root
            .join(file_path)
            .canonicalize()
            .unwrap_or_else(|_| file_path.to_path_buf());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight.entry(key.clone()).or_insert(0) += 1;
            let per_file = *in_flight.values().max().unwrap_or(&0);
            let total: usize = in_flight.values().sum();
            let mut max_per_file = self.max_per_file.lock().unwrap();
            *max_per_file = (*max_per_file).max(per_file);
            let mut max_total = self.max_total.lock().unwrap();
            *max_total = (*max_total).max(total);
        }

        tokio::time::sleep(Duration::from_millis(30)).await;

        let content = fs::read_to_string(self.root.join(file_path)).unwrap_or_default();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(n) = in_flight.get_mut(&key) {
                *n -= 1;
            }
        }

        if content.contains(&format!("# fixed:{}", test_name)) {
            VerificationResult::passed("1 passed")
        } else {
            VerificationResult::failed("1 failed")
        }
    }
}

/// Applies normally, but rollback of one file always fails.
struct FlakyRestoreApplier {
    inner: FsChangeApplier,
    broken: PathBuf,
}

impl ChangeApplier for FlakyRestoreApplier {
    fn apply(&self, change: &CodeChange, target: &Path) -> Result<Backup, ApplyError> {
        self.inner.apply(change, target)
    }

    fn restore(&self, backup: &Backup) -> Result<(), RestoreError> {
        if backup.path().ends_with(&self.broken) {
            return Err(RestoreError::Missing(backup.path().to_path_buf()));
        }
        self.inner.restore(backup)
    }
}

#[derive(Default)]
struct RecordingIsolation {
    events: Mutex<Vec<String>>,
    refuse: Option<&'static str>,
}

impl Isolation for RecordingIsolation {
    fn enter(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        if self.refuse == Some(record.test_function.as_str()) {
            anyhow::bail!("working tree is dirty");
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("enter {}", record.test_function));
        Ok(())
    }

    fn settle(&self, record: &ErrorRecord) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("settle {} {:?}", record.test_function, record.status()));
        Ok(())
    }
}

fn workspace(files: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for file in files {
        fs::write(dir.path().join(file), "def test():\n    pass\n").unwrap();
    }
    dir
}

fn record(file: &str, test: &str) -> ErrorRecord {
    ErrorRecord::new(file, test, ErrorDetails::new("AssertionError", "assert False"))
}

fn generator(dir: &TempDir, fixable: &[&'static str]) -> MarkerGenerator {
    MarkerGenerator {
        root: dir.path().to_path_buf(),
        fixable: fixable.iter().copied().collect(),
        cancel_on_call: None,
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(0.4, 0.1, 2).unwrap()
}

#[tokio::test]
async fn test_summary_counts_and_order() {
    let dir = workspace(&["test_a.py", "test_b.py"]);
    let gen = generator(&dir, &["test_one", "test_three"]);
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy());

    let mut session = FixSession::new(vec![
        record("test_a.py", "test_one"),
        record("test_b.py", "test_two"),
        record("test_a.py", "test_three"),
    ]);
    let ids: Vec<_> = session.records.iter().map(|r| r.id).collect();

    let summary = SessionRunner::new(&coordinator).run(&mut session).await;

    assert_eq!(summary.fixed, 2);
    assert_eq!(summary.abandoned, 1);
    assert!(!summary.all_fixed());
    assert_eq!(session.state, SessionState::Completed);
    assert!(session.finished_at.is_some());
    assert_eq!(session.records.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
    assert_eq!(summary.outcomes.iter().map(|o| o.id).collect::<Vec<_>>(), ids);

    let abandoned = &summary.outcomes[1];
    assert_eq!(abandoned.disposition, Disposition::Abandoned);
    assert_eq!(abandoned.attempts, 2);
    assert_eq!(abandoned.last_failure, Some(FailureKind::Verification));
    assert_eq!(
        session.modified_files(),
        vec![PathBuf::from("test_a.py")]
    );
    let content = fs::read_to_string(dir.path().join("test_a.py")).unwrap();
    assert!(content.contains("# fixed:test_one"));
    assert!(content.contains("# fixed:test_three"));
    assert_eq!(
        fs::read_to_string(dir.path().join("test_b.py")).unwrap(),
        "def test():\n    pass\n"
    );
}

#[tokio::test]
async fn test_same_file_records_never_overlap() {
    let dir = workspace(&["test_a.py", "test_b.py", "test_c.py"]);
    let gen = generator(&dir, &["a1", "a2", "b1", "b2", "c1"]);
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy());

    let mut session = FixSession::new(vec![
        record("test_a.py", "a1"),
        record("test_b.py", "b1"),
        record("test_a.py", "a2"),
        record("test_c.py", "c1"),
        record("test_b.py", "b2"),
    ]);
    let summary = SessionRunner::new(&coordinator)
        .with_lanes(3)
        .run(&mut session)
        .await;

    assert!(summary.all_fixed());
    assert_eq!(*verifier.max_per_file.lock().unwrap(), 1);
    assert!(*verifier.max_total.lock().unwrap() > 1);
    let names: Vec<_> = session
        .records
        .iter()
        .map(|r| r.test_function.as_str())
        .collect();
    assert_eq!(names, vec!["a1", "b1", "a2", "c1", "b2"]);
}

#[tokio::test]
async fn test_spellings_of_one_file_share_a_lane() {
    let dir = workspace(&["test_a.py", "test_b.py"]);
    let gen = generator(&dir, &["a1", "a2", "a3", "b1"]);
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy());

    let mut session = FixSession::new(vec![
        record("./test_a.py", "a1"),
        record("test_a.py", "a2"),
        record("test_b.py", "b1"),
        record(".//test_a.py", "a3"),
    ]);
    let summary = SessionRunner::new(&coordinator)
        .with_lanes(3)
        .run(&mut session)
        .await;

    assert!(summary.all_fixed());
    assert_eq!(*verifier.max_per_file.lock().unwrap(), 1);
    let content = fs::read_to_string(dir.path().join("test_a.py")).unwrap();
    assert!(content.contains("# fixed:a1"));
    assert!(content.contains("# fixed:a2"));
    assert!(content.contains("# fixed:a3"));
}

#[test]
fn test_lane_key_ignores_current_dir_components() {
    assert_eq!(lane_key(Path::new("./tests/a.py")), PathBuf::from("tests/a.py"));
    assert_eq!(lane_key(Path::new("tests/./a.py")), PathBuf::from("tests/a.py"));
    assert_ne!(lane_key(Path::new("tests/a.py")), lane_key(Path::new("tests/b.py")));
}

#[tokio::test]
async fn test_restore_failure_halts_only_that_file() {
    let dir = workspace(&["test_a.py", "test_b.py"]);
    let gen = generator(&dir, &["b1"]);
    let verifier = MarkerVerifier::new(dir.path());
    let applier = FlakyRestoreApplier {
        inner: FsChangeApplier::new(dir.path()),
        broken: PathBuf::from("test_a.py"),
    };
    let coordinator = FixAttemptCoordinator::new(&gen, applier, &verifier, policy());

    let mut session = FixSession::new(vec![
        record("test_a.py", "a1"),
        record("test_a.py", "a2"),
        record("test_b.py", "b1"),
    ]);
    let summary = SessionRunner::new(&coordinator).run(&mut session).await;

    let dispositions: Vec<_> = summary.outcomes.iter().map(|o| o.disposition).collect();
    assert_eq!(
        dispositions,
        vec![
            Disposition::Inconsistent,
            Disposition::Skipped,
            Disposition::Fixed
        ]
    );
    assert_eq!(summary.outcomes[0].last_failure, Some(FailureKind::Restore));
    assert!(summary.outcomes[0].note.is_some());
    assert!(session.records[1].attempts().is_empty());
    assert_eq!(session.records[0].status(), ErrorStatus::Unfixed);
    assert_eq!(session.state, SessionState::Failed);
}

#[tokio::test]
async fn test_unselected_records_are_skipped_untouched() {
    let dir = workspace(&["test_a.py"]);
    let gen = generator(&dir, &["a1", "a2"]);
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy());

    let mut session = FixSession::new(vec![record("test_a.py", "a1"), record("test_a.py", "a2")]);
    let summary = SessionRunner::new(&coordinator)
        .run_selected(&mut session, |r| r.test_function == "a2")
        .await;

    assert_eq!(summary.fixed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.outcomes[0].disposition, Disposition::Skipped);
    assert_eq!(session.records[0].status(), ErrorStatus::Unfixed);
    assert!(session.records[0].attempts().is_empty());
    assert!(!summary.all_fixed());
}

#[tokio::test]
async fn test_isolation_wraps_each_record() {
    let dir = workspace(&["test_a.py", "test_b.py"]);
    let gen = generator(&dir, &["a1"]);
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy());
    let isolation = RecordingIsolation {
        refuse: Some("c1"),
        ..Default::default()
    };

    let mut session = FixSession::new(vec![
        record("test_a.py", "a1"),
        record("test_b.py", "b1"),
        record("test_b.py", "c1"),
    ]);
    let summary = SessionRunner::new(&coordinator)
        .with_lanes(4)
        .with_isolation(&isolation)
        .run(&mut session)
        .await;

    assert_eq!(
        *isolation.events.lock().unwrap(),
        vec![
            "enter a1".to_string(),
            "settle a1 Fixed".to_string(),
            "enter b1".to_string(),
            "settle b1 Abandoned".to_string(),
        ]
    );
    assert_eq!(*verifier.max_total.lock().unwrap(), 1);
    assert_eq!(summary.outcomes[2].disposition, Disposition::Skipped);
    assert!(summary.outcomes[2]
        .note
        .as_deref()
        .unwrap_or_default()
        .contains("dirty"));
}

#[tokio::test]
async fn test_cancellation_skips_remaining_records() {
    let dir = workspace(&["test_a.py", "test_b.py"]);
    let cancel = CancellationFlag::new();
    let mut gen = generator(&dir, &["a1", "b1"]);
    gen.cancel_on_call = Some(cancel.clone());
    let verifier = MarkerVerifier::new(dir.path());
    let coordinator =
        FixAttemptCoordinator::new(&gen, FsChangeApplier::new(dir.path()), &verifier, policy())
            .with_cancellation(cancel);

    let mut session = FixSession::new(vec![record("test_a.py", "a1"), record("test_b.py", "b1")]);
    let summary = SessionRunner::new(&coordinator).run(&mut session).await;

    // The in-flight attempt completes; nothing new starts.
    assert_eq!(summary.outcomes[0].disposition, Disposition::Fixed);
    assert_eq!(summary.outcomes[1].disposition, Disposition::Skipped);
    assert!(session.records[1].attempts().is_empty());
    assert_eq!(session.state, SessionState::Cancelled);
}

#[test]
fn test_limit_keeps_the_first_records() {
    let session = FixSession::new(vec![
        record("test_b.py", "b1"),
        record("test_a.py", "a1"),
        record("test_a.py", "a2"),
    ])
    .with_limit(1);
    assert_eq!(session.records.len(), 1);
    assert_eq!(session.records[0].test_function, "b1");
    assert_eq!(session.warnings, vec!["2 later failure(s) not attempted"]);

    let whole = FixSession::new(vec![record("test_a.py", "a1")]).with_limit(1);
    assert_eq!(whole.records.len(), 1);
    assert!(whole.warnings.is_empty());
}
