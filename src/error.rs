//! Error types for the fix-attempt core.
//!
//! Each step of an attempt has its own error so the coordinator can match
//! on the failing step instead of inspecting messages. Plumbing outside
//! the core (git, discovery, CLI) uses `anyhow` instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The fix generator could not produce a usable change.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("fix generator unavailable: {0}")]
    Unavailable(String),

    #[error("unusable proposal: {0}")]
    Unusable(String),

    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// A proposed change could not be written. Nothing was modified on disk.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("target does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("target is read-only: {}", .0.display())]
    ReadOnly(PathBuf),

    #[error("target is outside the workspace: {0}")]
    OutsideRoot(String),

    #[error("target no longer matches the proposal's original text: {}", .0.display())]
    Stale(PathBuf),

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A backup could not be written back.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup target was removed: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to write backup to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid settings, raised before any attempt starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("initial temperature {0} is outside [0.0, {max}]", max = crate::retry::MAX_TEMPERATURE)]
    Temperature(f64),

    #[error("temperature increment {0} must be finite and non-negative")]
    Increment(f64),

    #[error("max attempts must be at least 1")]
    MaxAttempts,

    #[error("{0} timeout must be greater than zero")]
    Timeout(&'static str),

    #[error("lane count must be at least 1")]
    Lanes,

    #[error("invalid settings file {path}: {message}")]
    File { path: String, message: String },
}

/// Illegal transition on an error record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("record is not unfixed")]
    NotUnfixed,

    #[error("attempt {0} is still pending")]
    AttemptInFlight(u32),

    #[error("no attempt is pending")]
    NoPendingAttempt,
}

/// Errors that end `attempt_fix` early.
#[derive(Debug, Error)]
pub enum FixError {
    /// The file for this record is in an unknown state.
    #[error("restore failed for record {id}: {source}")]
    Restore {
        id: Uuid,
        #[source]
        source: RestoreError,
    },

    #[error("cancelled before the next attempt")]
    Cancelled,

    #[error(transparent)]
    Model(#[from] ModelError),
}
