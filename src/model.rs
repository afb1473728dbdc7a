//! Error records and their fix history
//!
//! An `ErrorRecord` owns its attempts. The list is only reachable through a
//! read-only slice; every change goes through the transition methods below,
//! which keep the status and the last attempt in agreement.

use crate::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Overall state of one failing test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Unfixed,
    Fixed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
}

/// Which step ended a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Generation,
    Apply,
    Verification,
    Restore,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Generation => "no usable proposal",
            FailureKind::Apply => "proposal could not be applied",
            FailureKind::Verification => "proposal failed the test",
            FailureKind::Restore => "rollback failed",
        }
    }
}

/// Classification of a test failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Exception name or `AssertionError`
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorDetails {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// A proposed whole-file edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    pub original: String,
    pub modified: String,
    pub description: String,
}

impl CodeChange {
    pub fn new(
        original: impl Into<String>,
        modified: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            original: original.into(),
            modified: modified.into(),
            description: description.into(),
        }
    }
}

/// One generate/apply/verify cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub number: u32,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<CodeChange>,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Error text or truncated test output for a failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One failing test and everything tried against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    /// Path of the file the fix is applied to, relative to the workspace root
    pub file_path: PathBuf,
    /// Qualified test name (`TestClass::test_name`); empty for module-level errors
    pub test_function: String,
    pub details: ErrorDetails,
    attempts: Vec<FixAttempt>,
    status: ErrorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inconsistency: Option<String>,
}

impl ErrorRecord {
    pub fn new(
        file_path: impl Into<PathBuf>,
        test_function: impl Into<String>,
        details: ErrorDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            test_function: test_function.into(),
            details,
            attempts: Vec::new(),
            status: ErrorStatus::Unfixed,
            inconsistency: None,
        }
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    pub fn attempts(&self) -> &[FixAttempt] {
        &self.attempts
    }

    /// Attempts that have left Pending
    pub fn settled_attempts(&self) -> &[FixAttempt] {
        match self.attempts.last() {
            Some(last) if last.status == AttemptStatus::Pending => {
                &self.attempts[..self.attempts.len() - 1]
            }
            _ => &self.attempts,
        }
    }

    pub fn last_attempt(&self) -> Option<&FixAttempt> {
        self.attempts.last()
    }

    pub fn pending_attempt(&self) -> Option<&FixAttempt> {
        self.attempts
            .last()
            .filter(|a| a.status == AttemptStatus::Pending)
    }

    /// Failure kind of the most recent attempt, if it failed
    pub fn last_failure(&self) -> Option<FailureKind> {
        self.attempts.last().and_then(|a| a.failure)
    }

    /// Set when a rollback failed and the file content is unknown
    pub fn inconsistency(&self) -> Option<&str> {
        self.inconsistency.as_deref()
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistency.is_some()
    }

    /// `path::test` node id as understood by pytest
    pub fn node_id(&self) -> String {
        node_id(&self.file_path, &self.test_function)
    }

    /// Appends a Pending attempt and returns its number
    pub fn begin_attempt(&mut self, temperature: f64) -> Result<u32, ModelError> {
        if self.status != ErrorStatus::Unfixed {
            return Err(ModelError::NotUnfixed);
        }
        if let Some(pending) = self.pending_attempt() {
            return Err(ModelError::AttemptInFlight(pending.number));
        }

        let number = self.attempts.len() as u32 + 1;
        self.attempts.push(FixAttempt {
            number,
            temperature,
            change: None,
            status: AttemptStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
            detail: None,
        });
        Ok(number)
    }

    /// Closes the pending attempt as Success and marks the record Fixed
    pub fn complete_success(&mut self, change: CodeChange) -> Result<(), ModelError> {
        let attempt = self.pending_mut()?;
        attempt.change = Some(change);
        attempt.status = AttemptStatus::Success;
        attempt.ended_at = Some(Utc::now());
        self.status = ErrorStatus::Fixed;
        Ok(())
    }

    /// Closes the pending attempt as Failed
    pub fn complete_failure(
        &mut self,
        kind: FailureKind,
        change: Option<CodeChange>,
        detail: impl Into<String>,
    ) -> Result<(), ModelError> {
        let attempt = self.pending_mut()?;
        attempt.change = change;
        attempt.status = AttemptStatus::Failed;
        attempt.failure = Some(kind);
        attempt.detail = Some(detail.into());
        attempt.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Marks an exhausted record Abandoned
    pub fn abandon(&mut self) -> Result<(), ModelError> {
        if self.status != ErrorStatus::Unfixed {
            return Err(ModelError::NotUnfixed);
        }
        if let Some(pending) = self.pending_attempt() {
            return Err(ModelError::AttemptInFlight(pending.number));
        }
        self.status = ErrorStatus::Abandoned;
        Ok(())
    }

    /// Leaves the record Unfixed but excluded from further attempts
    pub fn flag_inconsistent(&mut self, note: impl Into<String>) {
        self.inconsistency = Some(note.into());
    }

    fn pending_mut(&mut self) -> Result<&mut FixAttempt, ModelError> {
        match self.attempts.last_mut() {
            Some(last) if last.status == AttemptStatus::Pending => Ok(last),
            _ => Err(ModelError::NoPendingAttempt),
        }
    }
}

pub fn node_id(file_path: &Path, test_function: &str) -> String {
    let path = file_path.to_string_lossy().replace('\\', "/");
    if test_function.is_empty() {
        path
    } else {
        format!("{}::{}", path, test_function)
    }
}
