//! The fix-attempt loop for one error record
//!
//! Each attempt is generate, apply, verify, then keep or restore. Every
//! attempt that does not succeed leaves the target file as it was before
//! the attempt began, except when the restore itself fails; in that case the
//! record is flagged and the loop stops.
//!
//! Cancellation is cooperative and observed between attempts. An abort also
//! interrupts generation or verification, but an applied change is still
//! either kept by a passing test or rolled back before the loop returns.

use crate::apply::{Backup, ChangeApplier};
use crate::error::{FixError, GenerationError, RestoreError};
use crate::generate::FixGenerator;
use crate::model::{CodeChange, ErrorRecord, ErrorStatus, FailureKind};
use crate::retry::RetryPolicy;
use crate::util::truncate;
use crate::verify::TestVerifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};


pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Extra time given to a verifier past its own timeout before we stop waiting.
const VERIFICATION_GRACE: Duration = Duration::from_secs(5);
const MAX_DETAIL_CHARS: usize = 2000;

/// How often a running step looks for an abort.
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Shared stop signal.
///
/// `cancel` is observed at the top of each attempt. `abort` also interrupts
/// the step in flight; an applied change is still rolled back first.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.cancel();
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort` has been called.
    async fn aborted(&self) {
        while !self.is_aborted() {
            tokio::time::sleep(ABORT_POLL).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub generation: Duration,
    pub verification: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            generation: DEFAULT_GENERATION_TIMEOUT,
            verification: DEFAULT_VERIFICATION_TIMEOUT,
        }
    }
}

/// How one attempt ended
enum AttemptOutcome {
    Passed(CodeChange),
    Failed {
        kind: FailureKind,
        change: Option<CodeChange>,
        detail: String,
    },
    RestoreFailed {
        change: CodeChange,
        source: RestoreError,
    },
}

pub struct FixAttemptCoordinator<G, A, V> {
    generator: G,
    applier: A,
    verifier: V,
    policy: RetryPolicy,
    timeouts: StepTimeouts,
    cancel: CancellationFlag,
}

impl<G, A, V> FixAttemptCoordinator<G, A, V>
where
    G: FixGenerator,
    A: ChangeApplier,
    V: TestVerifier,
{
    pub fn new(generator: G, applier: A, verifier: V, policy: RetryPolicy) -> Self {
        Self {
            generator,
            applier,
            verifier,
            policy,
            timeouts: StepTimeouts::default(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Drives `error` until it is Fixed, Abandoned, or a rollback fails.
    ///
    /// Returns `Ok(false)` without recording anything when the record is not
    /// Unfixed. Attempts already on the record count against the budget.
    pub async fn attempt_fix(&self, error: &mut ErrorRecord) -> Result<bool, FixError> {
        if error.status() != ErrorStatus::Unfixed || error.is_inconsistent() {
            debug!(id = %error.id, status = ?error.status(), "record not eligible for fixing");
            return Ok(false);
        }

        let mut used = error.attempts().len() as u32;
        if used > self.policy.max_attempts() {
            warn!(
                test = %error.node_id(),
                attempts = used,
                max = self.policy.max_attempts(),
                "record already holds more attempts than allowed; leaving it unfixed"
            );
            return Ok(false);
        }
        while self.policy.should_continue(used) {
            if self.cancel.is_cancelled() {
                info!(id = %error.id, attempts = used, "cancelled before next attempt");
                return Err(FixError::Cancelled);
            }

            let temperature = self.policy.next_temperature(used + 1);
            let number = error.begin_attempt(temperature)?;
            used = number;
            info!(
                test = %error.node_id(),
                attempt = number,
                max = self.policy.max_attempts(),
                temperature,
                "starting fix attempt"
            );

            match self.run_attempt(error, temperature).await {
                AttemptOutcome::Passed(change) => {
                    info!(test = %error.node_id(), attempt = number, "fix verified");
                    error.complete_success(change)?;
                    return Ok(true);
                }
                AttemptOutcome::Failed {
                    kind,
                    change,
                    detail,
                } => {
                    warn!(
                        test = %error.node_id(),
                        attempt = number,
                        kind = ?kind,
                        "{}: {}",
                        kind.label(),
                        truncate(detail.lines().next().unwrap_or_default(), 200)
                    );
                    error.complete_failure(kind, change, truncate(&detail, MAX_DETAIL_CHARS))?;
                }
                AttemptOutcome::RestoreFailed { change, source } => {
                    error!(
                        test = %error.node_id(),
                        attempt = number,
                        "rollback failed, leaving record unfixed: {}",
                        source
                    );
                    error.complete_failure(FailureKind::Restore, Some(change), source.to_string())?;
                    error.flag_inconsistent(format!(
                        "attempt {} could not restore {}: {}",
                        number,
                        error.file_path.display(),
                        source
                    ));
                    return Err(FixError::Restore {
                        id: error.id,
                        source,
                    });
                }
            }
        }

        info!(test = %error.node_id(), attempts = used, "retry budget exhausted");
        error.abandon()?;
        Ok(false)
    }

    async fn run_attempt(&self, error: &ErrorRecord, temperature: f64) -> AttemptOutcome {
        let prior = error.settled_attempts();
        let proposal = tokio::select! {
            proposal = tokio::time::timeout(
                self.timeouts.generation,
                self.generator.propose(error, temperature, prior),
            ) => proposal,
            _ = self.cancel.aborted() => {
                return AttemptOutcome::Failed {
                    kind: FailureKind::Generation,
                    change: None,
                    detail: "interrupted before a proposal arrived".to_string(),
                };
            }
        };
        let change = match proposal {
            Ok(Ok(change)) => change,
            Ok(Err(e)) => return generation_failed(e),
            Err(_) => return generation_failed(GenerationError::Timeout(self.timeouts.generation)),
        };

        let backup = match self.applier.apply(&change, &error.file_path) {
            Ok(backup) => backup,
            Err(e) => {
                return AttemptOutcome::Failed {
                    kind: FailureKind::Apply,
                    change: Some(change),
                    detail: e.to_string(),
                }
            }
        };

        // An abort stops waiting on the verifier but never skips the rollback.
        let verification = tokio::select! {
            result = tokio::time::timeout(
                self.timeouts.verification + VERIFICATION_GRACE,
                self.verifier.run_single(
                    &error.file_path,
                    &error.test_function,
                    self.timeouts.verification,
                ),
            ) => Some(result),
            _ = self.cancel.aborted() => None,
        };
        let output = match verification {
            Some(Ok(result)) if result.passed => return AttemptOutcome::Passed(change),
            Some(Ok(result)) => result.output,
            Some(Err(_)) => format!(
                "verification timed out after {}s",
                self.timeouts.verification.as_secs()
            ),
            None => "verification interrupted; change rolled back".to_string(),
        };

        self.roll_back(&backup, change, output)
    }

    fn roll_back(&self, backup: &Backup, change: CodeChange, output: String) -> AttemptOutcome {
        match self.applier.restore(backup) {
            Ok(()) => AttemptOutcome::Failed {
                kind: FailureKind::Verification,
                change: Some(change),
                detail: output,
            },
            Err(source) => AttemptOutcome::RestoreFailed { change, source },
        }
    }
}

fn generation_failed(err: GenerationError) -> AttemptOutcome {
    AttemptOutcome::Failed {
        kind: FailureKind::Generation,
        change: None,
        detail: err.to_string(),
    }
}
