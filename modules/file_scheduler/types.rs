//! Types describing the outcome of one File Task

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::modules::conversation::{ConversationDocument, FailureKind, UnitStatus};

/// Overall result of completing one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateStatus {
    AllSucceeded,
    /// At least one unit failed and at least one completed
    PartialFailure,
    AllFailed,
    /// Cancelled before every pending unit was admitted
    Interrupted,
}

impl AggregateStatus {
    pub fn from_counts(completed: usize, failed: usize, pending: usize) -> Self {
        if pending > 0 {
            AggregateStatus::Interrupted
        } else if failed == 0 {
            AggregateStatus::AllSucceeded
        } else if completed == 0 {
            AggregateStatus::AllFailed
        } else {
            AggregateStatus::PartialFailure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::AllSucceeded => "all-succeeded",
            AggregateStatus::PartialFailure => "partial-failure",
            AggregateStatus::AllFailed => "all-failed",
            AggregateStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub position: usize,
    pub status: UnitStatus,
    /// Attempts made in this run, 0 when the unit needed no job
    pub attempts: u32,
    pub failure_kind: Option<FailureKind>,
}

/// Result of one File Task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTaskResult {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub status: AggregateStatus,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub jobs_dispatched: usize,
    pub units: Vec<UnitReport>,
    pub processing_time_ms: u64,
}

impl FileTaskResult {
    pub fn from_document(
        source: PathBuf,
        destination: PathBuf,
        document: &ConversationDocument,
        jobs_dispatched: usize,
        processing_time_ms: u64,
    ) -> Self {
        let mut units: Vec<UnitReport> = document
            .units
            .iter()
            .map(|u| UnitReport {
                position: u.position(),
                status: u.status(),
                attempts: u.attempts(),
                failure_kind: u.failure().map(|f| f.kind),
            })
            .collect();
        units.sort_by_key(|u| u.position);

        let count = |status: UnitStatus| units.iter().filter(|u| u.status == status).count();
        let completed = count(UnitStatus::Completed);
        let failed = count(UnitStatus::Failed);
        let pending = count(UnitStatus::Pending);

        Self {
            source,
            destination,
            status: AggregateStatus::from_counts(completed, failed, pending),
            completed,
            failed,
            pending,
            jobs_dispatched,
            units,
            processing_time_ms,
        }
    }

    pub fn unit(&self, position: usize) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.position == position)
    }

    /// One line for the user
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} ({} completed, {} failed",
            self.destination.display(),
            self.status,
            self.completed,
            self.failed
        );
        if self.pending > 0 {
            line.push_str(&format!(", {} pending", self.pending));
        }
        line.push_str(&format!(
            "; {} job(s) in {:.1}s)",
            self.jobs_dispatched,
            self.processing_time_ms as f64 / 1000.0
        ));
        line
    }
}
