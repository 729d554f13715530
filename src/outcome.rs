use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a record was left out without being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingIdentifier,
    MissingField(&'static str),
    UnresolvedReference {
        field: &'static str,
        external_id: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdentifier => write!(f, "missing external identifier"),
            Self::MissingField(field) => write!(f, "missing required field `{field}`"),
            Self::UnresolvedReference { field, external_id } => {
                write!(f, "unresolved reference {field}={external_id}")
            }
        }
    }
}

/// Result of handling exactly one source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Merged,
    Skipped(SkipReason),
    Errored(String),
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Merged)
    }
}

/// Aggregated counts for one phase run.
///
/// `unresolved` is kept apart from `skipped` so operators can tell bad
/// references from other bad data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub merged: u64,
    pub skipped: u64,
    pub unresolved: u64,
    pub errors: u64,
    pub blank_rows: u64,
}

impl PhaseStats {
    pub fn record(&mut self, outcome: &RecordOutcome) {
        self.processed += 1;
        match outcome {
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Merged => self.merged += 1,
            RecordOutcome::Skipped(SkipReason::UnresolvedReference { .. }) => self.unresolved += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Errored(_) => self.errors += 1,
        }
    }

    pub fn success_count(&self) -> u64 {
        self.created + self.updated + self.merged
    }

    /// Tuple compared by the dry-run/live symmetry check.
    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.created,
            self.updated + self.merged,
            self.skipped + self.unresolved,
            self.errors,
        )
    }
}
