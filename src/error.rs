//! Error taxonomy for the migration core.
//!
//! Record-level problems ([`RecordError`]) never escalate: they become a
//! [`RecordOutcome`](crate::outcome::RecordOutcome) and the phase keeps going.
//! Phase-level problems ([`MigrationError`]) abort the phase invocation.

use std::time::Duration;

use thiserror::Error;

use crate::outcome::{RecordOutcome, SkipReason};

/// Per-record problem found while extracting, transforming or resolving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no external identifier")]
    MissingIdentifier,
    #[error("required field `{0}` is blank")]
    MissingField(&'static str),
    #[error("`{field}` references unknown external id {external_id}")]
    UnresolvedReference {
        field: &'static str,
        external_id: String,
    },
    #[error("cannot transform `{field}`: {message}")]
    Transform {
        field: &'static str,
        message: String,
    },
}

impl RecordError {
    pub fn transform(field: &'static str, message: impl Into<String>) -> Self {
        Self::Transform {
            field,
            message: message.into(),
        }
    }

    pub fn unresolved(field: &'static str, external_id: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            field,
            external_id: external_id.into(),
        }
    }

    /// Bad data is skipped, shape problems are errors.
    pub fn into_outcome(self) -> RecordOutcome {
        match self {
            Self::MissingIdentifier => RecordOutcome::Skipped(SkipReason::MissingIdentifier),
            Self::MissingField(field) => RecordOutcome::Skipped(SkipReason::MissingField(field)),
            Self::UnresolvedReference { field, external_id } => {
                RecordOutcome::Skipped(SkipReason::UnresolvedReference { field, external_id })
            }
            err @ Self::Transform { .. } => RecordOutcome::Errored(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("write did not finish within {0:?}")]
    Timeout(Duration),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid json page: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported source: {0}")]
    Unsupported(String),
    #[error("pagination for `{resource}` exceeded {max_pages} pages")]
    PageLimit { resource: String, max_pages: u32 },
}

/// Failure of a whole phase invocation (or of the validator).
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("phase `{phase}` depends on phases that are not completed: {}", .missing.join(", "))]
    DependencyNotSatisfied { phase: String, missing: Vec<String> },
    #[error("unknown phase `{0}`")]
    UnknownPhase(String),
    #[error("validation needs every phase completed; pending: {}", .pending.join(", "))]
    PhasesNotCompleted { pending: Vec<String> },
    #[error("validation mismatch for: {}", .failed.join(", "))]
    ValidationMismatch { failed: Vec<String> },
    #[error("checkpoint error on {path}: {message}")]
    Checkpoint { path: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_errors_are_counted_as_errors() {
        let outcome = RecordError::transform("dob", "unparseable date `31/31/2020`").into_outcome();
        assert!(matches!(outcome, RecordOutcome::Errored(ref m) if m.contains("dob")));
    }

    #[test]
    fn bad_references_are_skips_not_errors() {
        let outcome = RecordError::unresolved("id_contact", "77").into_outcome();
        assert_eq!(
            outcome,
            RecordOutcome::Skipped(SkipReason::UnresolvedReference {
                field: "id_contact",
                external_id: "77".into()
            })
        );
    }

    #[test]
    fn dependency_error_lists_missing_phases() {
        let err = MigrationError::DependencyNotSatisfied {
            phase: "link-patient-referrers".into(),
            missing: vec!["import-patients".into(), "import-referrers".into()],
        };
        assert_eq!(
            err.to_string(),
            "phase `link-patient-referrers` depends on phases that are not completed: import-patients, import-referrers"
        );
    }
}
