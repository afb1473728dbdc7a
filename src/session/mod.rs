//! Running the coordinator over every record in a session
//!
//! Records are grouped into lanes by file path. A lane is processed in input
//! order; different lanes may run concurrently on the current task. Two
//! records for the same file are never in flight together.

use crate::apply::ChangeApplier;
use crate::coordinator::FixAttemptCoordinator;
use crate::error::FixError;
use crate::generate::FixGenerator;
use crate::model::{ErrorRecord, ErrorStatus, FailureKind};
use crate::verify::TestVerifier;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    /// At least one record was left in an unknown state
    Failed,
    Cancelled,
}

/// One run over a set of discovered failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSession {
    pub id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Test path the session was discovered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub records: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl FixSession {
    pub fn new(records: Vec<ErrorRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Running,
            started_at: Utc::now(),
            finished_at: None,
            scope: None,
            branch: None,
            records,
            warnings: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Keeps the first `limit` records in discovery order and notes how
    /// many were dropped.
    pub fn with_limit(mut self, limit: usize) -> Self {
        let dropped = self.records.len().saturating_sub(limit);
        if dropped > 0 {
            self.records.truncate(limit);
            self.warnings
                .push(format!("{} later failure(s) not attempted", dropped));
        }
        self
    }

    pub fn count(&self, status: ErrorStatus) -> usize {
        self.records.iter().filter(|r| r.status() == status).count()
    }

    /// Files touched by fixed records
    pub fn modified_files(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| r.status() == ErrorStatus::Fixed)
            .filter(|r| seen.insert(r.file_path.clone()))
            .map(|r| r.file_path.clone())
            .collect()
    }
}

/// Hook placed around each record, e.g. a branch per fix.
pub trait Isolation {
    /// Whether only one record may be in flight at a time.
    fn exclusive(&self) -> bool {
        true
    }

    /// Prepares the workspace before `record` is attempted.
    fn enter(&self, record: &ErrorRecord) -> anyhow::Result<()>;

    /// Commits or discards after `record` has reached its outcome.
    fn settle(&self, record: &ErrorRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Fixed,
    Abandoned,
    /// Rollback failed; file content unknown
    Inconsistent,
    /// Not attempted (declined, cancelled, or its lane halted)
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorOutcome {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub test_function: String,
    pub disposition: Disposition,
    pub attempts: usize,
    /// Failure kind of the final attempt
    pub last_failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub fixed: usize,
    pub abandoned: usize,
    pub inconsistent: usize,
    pub skipped: usize,
    pub outcomes: Vec<ErrorOutcome>,
}

impl SessionSummary {
    fn from_outcomes(outcomes: Vec<ErrorOutcome>) -> Self {
        let count = |d: Disposition| outcomes.iter().filter(|o| o.disposition == d).count();
        Self {
            fixed: count(Disposition::Fixed),
            abandoned: count(Disposition::Abandoned),
            inconsistent: count(Disposition::Inconsistent),
            skipped: count(Disposition::Skipped),
            outcomes,
        }
    }

    /// True when every record in the session ended Fixed.
    pub fn all_fixed(&self) -> bool {
        self.fixed == self.outcomes.len()
    }
}

pub struct SessionRunner<'a, G, A, V> {
    coordinator: &'a FixAttemptCoordinator<G, A, V>,
    isolation: Option<&'a dyn Isolation>,
    lanes: usize,
}

impl<'a, G, A, V> SessionRunner<'a, G, A, V>
where
    G: FixGenerator,
    A: ChangeApplier,
    V: TestVerifier,
{
    pub fn new(coordinator: &'a FixAttemptCoordinator<G, A, V>) -> Self {
        Self {
            coordinator,
            isolation: None,
            lanes: 1,
        }
    }

    /// Maximum number of different-file lanes in flight.
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes.max(1);
        self
    }

    pub fn with_isolation(mut self, isolation: &'a dyn Isolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub async fn run(&self, session: &mut FixSession) -> SessionSummary {
        self.run_selected(session, |_| true).await
    }

    /// Attempts only the records `select` accepts; the rest are reported skipped.
    pub async fn run_selected<F>(&self, session: &mut FixSession, select: F) -> SessionSummary
    where
        F: Fn(&ErrorRecord) -> bool,
    {
        let lanes = if self.isolation.map(|i| i.exclusive()).unwrap_or(false) {
            1
        } else {
            self.lanes
        };

        let records = std::mem::take(&mut session.records);
        let mut queued = Vec::with_capacity(records.len());
        let mut declined = Vec::new();
        for (index, record) in records.into_iter().enumerate() {
            if select(&record) {
                queued.push((index, record));
            } else {
                declined.push((index, record));
            }
        }

        info!(
            session = %session.id,
            records = queued.len(),
            declined = declined.len(),
            lanes,
            "starting fix session"
        );

        let mut finished: Vec<(usize, ErrorRecord, ErrorOutcome)> = if lanes == 1 {
            self.run_lane(queued).await
        } else {
            let partitions = partition_by_file(queued);
            stream::iter(partitions)
                .map(|lane| self.run_lane(lane))
                .buffer_unordered(lanes)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .flatten()
                .collect()
        };

        for (index, record) in declined {
            let outcome = outcome_for(&record, Disposition::Skipped, Some("not selected".into()));
            finished.push((index, record, outcome));
        }
        finished.sort_by_key(|(index, _, _)| *index);

        let mut outcomes = Vec::with_capacity(finished.len());
        for (_, record, outcome) in finished {
            session.records.push(record);
            outcomes.push(outcome);
        }

        let summary = SessionSummary::from_outcomes(outcomes);
        session.finished_at = Some(Utc::now());
        session.state = if self.coordinator.cancellation().is_cancelled() {
            SessionState::Cancelled
        } else if summary.inconsistent > 0 {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        info!(
            session = %session.id,
            fixed = summary.fixed,
            abandoned = summary.abandoned,
            inconsistent = summary.inconsistent,
            skipped = summary.skipped,
            "fix session finished"
        );
        summary
    }

    /// Processes one lane in order; a failed rollback halts that file.
    async fn run_lane(
        &self,
        lane: Vec<(usize, ErrorRecord)>,
    ) -> Vec<(usize, ErrorRecord, ErrorOutcome)> {
        let mut halted: HashSet<PathBuf> = HashSet::new();
        let mut results = Vec::with_capacity(lane.len());

        for (index, mut record) in lane {
            if self.coordinator.cancellation().is_cancelled() {
                let outcome = outcome_for(&record, Disposition::Skipped, Some("cancelled".into()));
                results.push((index, record, outcome));
                continue;
            }
            if halted.contains(&lane_key(&record.file_path)) {
                let outcome = outcome_for(
                    &record,
                    Disposition::Skipped,
                    Some("an earlier rollback on this file failed".into()),
                );
                results.push((index, record, outcome));
                continue;
            }

            if let Some(isolation) = self.isolation {
                if let Err(e) = isolation.enter(&record) {
                    warn!(test = %record.node_id(), "could not isolate record: {:#}", e);
                    let outcome =
                        outcome_for(&record, Disposition::Skipped, Some(format!("{:#}", e)));
                    results.push((index, record, outcome));
                    continue;
                }
            }

            let result = self.coordinator.attempt_fix(&mut record).await;
            let mut note = None;
            let disposition = match result {
                Ok(_) => disposition_of(&record),
                Err(FixError::Cancelled) => {
                    note = Some("cancelled".to_string());
                    Disposition::Skipped
                }
                Err(FixError::Restore { .. }) => {
                    halted.insert(lane_key(&record.file_path));
                    note = record.inconsistency().map(str::to_string);
                    Disposition::Inconsistent
                }
                Err(FixError::Model(e)) => {
                    warn!(test = %record.node_id(), "record rejected: {}", e);
                    note = Some(e.to_string());
                    disposition_of(&record)
                }
            };

            if let Some(isolation) = self.isolation {
                if let Err(e) = isolation.settle(&record) {
                    warn!(test = %record.node_id(), "could not settle isolation: {:#}", e);
                    note = Some(format!("{:#}", e));
                }
            }

            let outcome = outcome_for(&record, disposition, note);
            results.push((index, record, outcome));
        }

        results
    }
}

fn disposition_of(record: &ErrorRecord) -> Disposition {
    if record.is_inconsistent() {
        return Disposition::Inconsistent;
    }
    match record.status() {
        ErrorStatus::Fixed => Disposition::Fixed,
        ErrorStatus::Abandoned => Disposition::Abandoned,
        ErrorStatus::Unfixed => Disposition::Skipped,
    }
}

fn outcome_for(record: &ErrorRecord, disposition: Disposition, note: Option<String>) -> ErrorOutcome {
    ErrorOutcome {
        id: record.id,
        file_path: record.file_path.clone(),
        test_function: record.test_function.clone(),
        disposition,
        attempts: record.attempts().len(),
        last_failure: record.last_failure(),
        note,
    }
}

/// Key under which records share a lane; `./tests/a.py` and `tests/a.py`
/// name the same file.
fn lane_key(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Groups records by file path, lanes ordered by first appearance.
fn partition_by_file(records: Vec<(usize, ErrorRecord)>) -> Vec<Vec<(usize, ErrorRecord)>> {
    let mut lane_of: HashMap<PathBuf, usize> = HashMap::new();
    let mut lanes: Vec<Vec<(usize, ErrorRecord)>> = Vec::new();
    for (index, record) in records {
        let lane = *lane_of.entry(lane_key(&record.file_path)).or_insert_with(|| {
            lanes.push(Vec::new());
            lanes.len() - 1
        });
        lanes[lane].push((index, record));
    }
    lanes
}

#[cfg(test)]
mod tests;
