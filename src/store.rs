//! Session persistence
//!
//! Each session is one JSON file under `.branch-fixer/sessions/`. Writes go
//! through a temp file and rename; an advisory lock serialises writers from
//! concurrent processes.

use crate::session::{FixSession, SessionState};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const STATE_DIR: &str = ".branch-fixer";
const SESSIONS_DIR: &str = "sessions";
const LOCK_TIMEOUT_SECS: u64 = 10;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("timed out waiting for session store lock ({0}s)")]
    LockTimeout(u64),

    #[error("session store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {} is not valid: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct SessionStore {
    dir: PathBuf,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl SessionStore {
    /// Store rooted in the given workspace.
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            dir: workspace_root.join(STATE_DIR).join(SESSIONS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        self.ensure_ignored();
        Ok(())
    }

    /// Keeps the state directory out of `git status` via `.git/info/exclude`.
    fn ensure_ignored(&self) {
        let Some(root) = self.dir.parent().and_then(Path::parent) else {
            return;
        };
        let git_dir = root.join(".git");
        if !git_dir.is_dir() {
            return;
        }
        let exclude = git_dir.join("info").join("exclude");
        if let Err(e) = append_ignore_entry(&exclude, &format!("{}/", STATE_DIR)) {
            debug!("could not update {}: {}", exclude.display(), e);
        }
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        self.ensure_dir()?;
        let lock_path = self.dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(StoreError::Io {
                            path: lock_path,
                            source: err,
                        });
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(StoreError::LockTimeout(LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    pub fn save(&self, session: &FixSession) -> Result<PathBuf, StoreError> {
        let _lock = self.lock()?;
        let path = self.session_path(session.id);
        let content = serde_json::to_string_pretty(session)?;
        write_atomic(&path, &content).map_err(io_err(&path))?;
        debug!(session = %session.id, path = %path.display(), "saved session");
        Ok(path)
    }

    pub fn load(&self, id: Uuid) -> Result<FixSession, StoreError> {
        let path = self.session_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Stored sessions, oldest first. Unreadable files are skipped with a warning.
    pub fn list(&self, state: Option<SessionState>) -> Result<Vec<FixSession>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.load(id) {
                Ok(session) => {
                    if state.map(|s| s == session.state).unwrap_or(true) {
                        sessions.push(session);
                    }
                }
                Err(e) => warn!("skipping session file: {}", e),
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    /// Returns whether a session file was removed.
    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let _lock = self.lock()?;
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn append_ignore_entry(path: &Path, entry: &str) -> std::io::Result<()> {
    use std::io::Write;

    let content = fs::read_to_string(path).unwrap_or_default();
    if content.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# branch-fixer state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorDetails, ErrorRecord, FailureKind};
    use tempfile::TempDir;

    fn session_with_history() -> FixSession {
        let mut record = ErrorRecord::new(
            "tests/test_math.py",
            "test_add",
            ErrorDetails::new("AssertionError", "assert -1 == 3").with_stack_trace("E   assert"),
        );
        record.begin_attempt(0.4).unwrap();
        record
            .complete_failure(FailureKind::Generation, None, "timeout")
            .unwrap();
        FixSession::new(vec![record]).with_scope("tests")
    }

    #[test]
    fn test_save_then_load_keeps_history() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = session_with_history();

        let path = store.save(&session).unwrap();
        assert!(path.starts_with(dir.path().join(".branch-fixer/sessions")));

        let loaded = store.load(session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.scope.as_deref(), Some("tests"));
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].attempts(), session.records[0].attempts());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id), Err(StoreError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn test_list_filters_by_state_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let running = session_with_history();
        let mut done = session_with_history();
        done.state = SessionState::Completed;
        store.save(&running).unwrap();
        store.save(&done).unwrap();
        fs::write(store.dir().join("notes.txt"), "ignore me").unwrap();
        fs::write(store.dir().join(format!("{}.json", Uuid::new_v4())), "{not json").unwrap();

        assert_eq!(store.list(None).unwrap().len(), 2);
        let completed = store.list(Some(SessionState::Completed)).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);
    }

    #[test]
    fn test_list_without_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_delete_reports_whether_removed() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = session_with_history();
        store.save(&session).unwrap();

        assert!(store.delete(session.id).unwrap());
        assert!(!store.delete(session.id).unwrap());
    }

    #[test]
    fn test_state_dir_is_excluded_from_git() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git/info")).unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&session_with_history()).unwrap();
        store.save(&session_with_history()).unwrap();

        let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches(".branch-fixer/").count(), 1);
    }
}
