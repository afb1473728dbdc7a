//! Writing proposed changes to disk with a rollback handle
//!
//! `apply` hands the caller a `Backup` of the bytes it replaced; nothing is
//! kept inside the applier. `restore` writes those bytes back and can be
//! repeated safely.

use crate::error::{ApplyError, RestoreError};
use crate::model::CodeChange;
use crate::util::resolve_repo_path;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Original content of a file, captured before a change was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    path: PathBuf,
    original: Vec<u8>,
}

impl Backup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

pub trait ChangeApplier {
    /// Writes `change.modified` over `target`, returning what was there.
    fn apply(&self, change: &CodeChange, target: &Path) -> Result<Backup, ApplyError>;

    /// Puts the backed-up bytes back. Idempotent.
    fn restore(&self, backup: &Backup) -> Result<(), RestoreError>;
}

impl<T: ChangeApplier + ?Sized> ChangeApplier for &T {
    fn apply(&self, change: &CodeChange, target: &Path) -> Result<Backup, ApplyError> {
        (**self).apply(change, target)
    }

    fn restore(&self, backup: &Backup) -> Result<(), RestoreError> {
        (**self).restore(backup)
    }
}

/// Applier for files under a workspace root
#[derive(Debug, Clone)]
pub struct FsChangeApplier {
    root: PathBuf,
}

impl FsChangeApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The real file behind `path`. Writes go there so a symlinked target
    /// stays a symlink; the real file must still be inside the root.
    fn follow_links(&self, path: PathBuf) -> Result<PathBuf, ApplyError> {
        let real = match fs::canonicalize(&path) {
            Ok(real) => real,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ApplyError::NotFound(path)),
            Err(source) => return Err(ApplyError::Io { path, source }),
        };
        let root = self.root.canonicalize().map_err(|source| ApplyError::Io {
            path: self.root.clone(),
            source,
        })?;
        if !real.starts_with(&root) {
            return Err(ApplyError::OutsideRoot(format!(
                "{} resolves to {}, outside the workspace",
                path.display(),
                real.display()
            )));
        }
        Ok(real)
    }
}

impl ChangeApplier for FsChangeApplier {
    fn apply(&self, change: &CodeChange, target: &Path) -> Result<Backup, ApplyError> {
        let resolved = resolve_repo_path(&self.root, target).map_err(ApplyError::OutsideRoot)?;
        let path = self.follow_links(resolved.absolute)?;

        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ApplyError::NotFound(path)),
            Err(source) => return Err(ApplyError::Io { path, source }),
        };
        if !metadata.is_file() {
            return Err(ApplyError::NotFound(path));
        }
        if metadata.permissions().readonly() {
            return Err(ApplyError::ReadOnly(path));
        }

        let original = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) => return Err(ApplyError::Io { path, source }),
        };
        if original != change.original.as_bytes() {
            return Err(ApplyError::Stale(path));
        }

        if let Err(source) = write_atomic(&path, change.modified.as_bytes()) {
            return Err(match source.kind() {
                ErrorKind::PermissionDenied => ApplyError::ReadOnly(path),
                _ => ApplyError::Io { path, source },
            });
        }
        debug!(path = %path.display(), bytes = change.modified.len(), "applied change");

        Ok(Backup { path, original })
    }

    fn restore(&self, backup: &Backup) -> Result<(), RestoreError> {
        let path = backup.path.clone();
        if !path.is_file() {
            return Err(RestoreError::Missing(path));
        }
        if fs::read(&path).ok().as_deref() == Some(backup.original.as_slice()) {
            return Ok(());
        }
        write_atomic(&path, &backup.original).map_err(|source| RestoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "restored backup");
        Ok(())
    }
}

/// Temp file in the same directory, then rename; keeps the target's permissions.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let permissions = fs::metadata(path)?.permissions();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.branch-fixer.tmp", file_name));

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::set_permissions(&tmp_path, permissions)?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
