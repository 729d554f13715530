//! Durable per-phase progress, rewritten atomically after every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::outcome::PhaseStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase_name: String,
    pub status: PhaseStatus,
    pub total_items: Option<u64>,
    pub processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: PhaseStats,
    #[serde(default)]
    pub dry_run: bool,
}

impl PhaseCheckpoint {
    fn started(phase: &str, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            phase_name: phase.to_string(),
            status: PhaseStatus::InProgress,
            total_items: None,
            processed: 0,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            start_time: Some(now),
            end_time: None,
            stats: PhaseStats::default(),
            dry_run,
        }
    }

    fn apply_stats(&mut self, stats: &PhaseStats) {
        // processed never moves backwards within a phase
        self.processed = self.processed.max(stats.processed);
        self.success_count = stats.success_count();
        self.error_count = stats.errors;
        self.skipped_count = stats.skipped + stats.unresolved;
        self.stats = *stats;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseCheckpoint>,
}

impl CheckpointFile {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            last_update: now,
            current_phase: None,
            phases: BTreeMap::new(),
        }
    }
}

pub struct CheckpointTracker {
    /// `None` keeps everything in memory (dry runs).
    path: Option<PathBuf>,
    state: CheckpointFile,
    max_errors: usize,
}

fn checkpoint_error(path: &Path, message: impl ToString) -> MigrationError {
    MigrationError::Checkpoint {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

fn read_file(path: &Path) -> Result<Option<CheckpointFile>, MigrationError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| checkpoint_error(path, e))?;
    let state: CheckpointFile = serde_json::from_str(&raw).map_err(|e| checkpoint_error(path, e))?;
    for phase in state.phases.values() {
        if phase.status == PhaseStatus::InProgress {
            warn!(
                phase = %phase.phase_name,
                processed = phase.processed,
                "phase was interrupted; it counts as not completed and will rerun from the start"
            );
        }
    }
    Ok(Some(state))
}

impl CheckpointTracker {
    /// Open the checkpoint at `path`, creating an empty one if it is missing.
    pub fn load_or_new(path: impl Into<PathBuf>, max_errors: usize) -> Result<Self, MigrationError> {
        let path = path.into();
        let state = match read_file(&path)? {
            Some(state) => {
                info!(path = %path.display(), phases = state.phases.len(), "loaded checkpoint");
                state
            }
            None => CheckpointFile::new(Utc::now()),
        };
        Ok(Self {
            path: Some(path),
            state,
            max_errors,
        })
    }

    /// Seeded from `path` when it exists but never written back.
    pub fn detached(path: &Path, max_errors: usize) -> Result<Self, MigrationError> {
        let state = read_file(path)?.unwrap_or_else(|| CheckpointFile::new(Utc::now()));
        Ok(Self {
            path: None,
            state,
            max_errors,
        })
    }

    pub fn in_memory(max_errors: usize) -> Self {
        Self {
            path: None,
            state: CheckpointFile::new(Utc::now()),
            max_errors,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> &CheckpointFile {
        &self.state
    }

    pub fn phase(&self, phase: &str) -> Option<&PhaseCheckpoint> {
        self.state.phases.get(phase)
    }

    pub fn status(&self, phase: &str) -> PhaseStatus {
        self.phase(phase).map(|p| p.status).unwrap_or_default()
    }

    pub fn is_completed(&self, phase: &str) -> bool {
        self.status(phase) == PhaseStatus::Completed
    }

    pub fn start_phase(&mut self, phase: &str, dry_run: bool) -> Result<(), MigrationError> {
        let now = Utc::now();
        self.state
            .phases
            .insert(phase.to_string(), PhaseCheckpoint::started(phase, dry_run, now));
        self.state.current_phase = Some(phase.to_string());
        self.flush()
    }

    pub fn set_total(&mut self, phase: &str, total: u64) -> Result<(), MigrationError> {
        if let Some(entry) = self.state.phases.get_mut(phase) {
            entry.total_items = Some(total);
        }
        self.flush()
    }

    /// Record progress after one record; `error` is kept up to the cap.
    pub fn record(
        &mut self,
        phase: &str,
        stats: &PhaseStats,
        error: Option<String>,
    ) -> Result<(), MigrationError> {
        let max_errors = self.max_errors;
        if let Some(entry) = self.state.phases.get_mut(phase) {
            entry.apply_stats(stats);
            if let Some(error) = error {
                if entry.errors.len() < max_errors {
                    entry.errors.push(error);
                }
            }
        }
        self.flush()
    }

    pub fn finish(
        &mut self,
        phase: &str,
        status: PhaseStatus,
        stats: &PhaseStats,
        failure: Option<String>,
    ) -> Result<(), MigrationError> {
        if let Some(entry) = self.state.phases.get_mut(phase) {
            entry.apply_stats(stats);
            entry.status = status;
            entry.end_time = Some(Utc::now());
            if let Some(failure) = failure {
                entry.errors.push(failure);
            }
        }
        if self.state.current_phase.as_deref() == Some(phase) {
            self.state.current_phase = None;
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<(), MigrationError> {
        self.state.last_update = Utc::now();
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| checkpoint_error(parent, e))?;
        }
        let body = serde_json::to_vec_pretty(&self.state).map_err(|e| checkpoint_error(path, e))?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body).map_err(|e| checkpoint_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| checkpoint_error(path, e))?;
        Ok(())
    }
}
