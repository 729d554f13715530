//! Phase runner and the per-run [`MigrationContext`] handed to every phase.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointTracker, PhaseStatus};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, StoreError};
use crate::index::EntitySet;
use crate::link::LinkSet;
use crate::model::{Entity, LinkKind};
use crate::normalization::Normalizer;
use crate::outcome::{PhaseStats, RecordOutcome, SkipReason};
use crate::source::{ExtractStream, Extracted, SheetSpec, SourceRecord, SourceSet};
use crate::store::{ScratchStore, SharedStore};

/// One unit of migration work with a static dependency list.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    fn description(&self) -> &'static str;

    /// Sheet the phase reads; a single-file source override binds to it.
    fn sheet(&self) -> &'static SheetSpec;

    async fn run(&self, ctx: &mut MigrationContext) -> Result<()>;
}

#[derive(Clone)]
struct Progress {
    label: String,
    total: Option<u64>,
    every: u64,
    start: Instant,
    last_log: Instant,
    processed: u64,
}

impl Progress {
    fn new<L: Into<String>>(label: L, every: u64) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total: None,
            every: every.max(1),
            start: now,
            last_log: now,
            processed: 0,
        }
    }

    fn tick(&mut self) {
        self.processed += 1;
        if self.processed == 1 || self.processed % self.every == 0 {
            self.log();
        }
    }

    fn log(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_log) < Duration::from_millis(200) && self.processed > 1 {
            return;
        }
        self.last_log = now;
        let elapsed = now.duration_since(self.start).as_secs_f64().max(0.001);
        let rate = (self.processed as f64) / elapsed;
        match self.total {
            Some(total) if total > 0 => {
                let pct = (100.0 * self.processed as f64) / (total as f64);
                info!(target: "progress", label = %self.label, processed = self.processed, total, pct = %format!("{pct:.1}"), rate = %format!("{rate:.1}/s"), "progress");
            }
            _ => {
                info!(target: "progress", label = %self.label, processed = self.processed, rate = %format!("{rate:.1}/s"), "progress");
            }
        }
    }
}

struct ActivePhase {
    name: &'static str,
    stats: PhaseStats,
    progress: Progress,
}

/// Everything a phase may touch during one run. No process-wide state: the
/// store handle, sources, checkpoint and configuration all live here. A dry
/// run writes to a scratch copy of the store, never to the store itself.
pub struct MigrationContext {
    store: SharedStore,
    sources: SourceSet,
    tracker: CheckpointTracker,
    config: MigrationConfig,
    norm: Normalizer,
    active: Option<ActivePhase>,
}

impl MigrationContext {
    pub fn new(
        config: MigrationConfig,
        store: SharedStore,
        sources: SourceSet,
        tracker: CheckpointTracker,
    ) -> Self {
        let norm = sources.normalizer().clone();
        let store: SharedStore = if config.dry_run {
            std::sync::Arc::new(ScratchStore::new(store))
        } else {
            store
        };
        Self {
            store,
            sources,
            tracker,
            config,
            norm,
            active: None,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn norm(&self) -> &Normalizer {
        &self.norm
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    fn phase_name(&self) -> &'static str {
        self.active.as_ref().map_or("-", |a| a.name)
    }

    /// Fresh lookup index over everything committed so far.
    pub async fn load<T: Entity>(&self) -> Result<EntitySet<T>, MigrationError> {
        Ok(EntitySet::build(self.store.as_ref(), &self.norm, self.config.collision_policy).await?)
    }

    pub async fn load_links(&self, kind: LinkKind) -> Result<LinkSet, MigrationError> {
        Ok(LinkSet::build(self.store.as_ref(), kind).await?)
    }

    /// Start reading a sheet. The total recorded in the checkpoint is the
    /// number of non-blank rows, capped by `--limit`.
    pub async fn open(&mut self, sheet: &'static SheetSpec) -> Result<RecordFeed, MigrationError> {
        let extractor = self.sources.extractor(sheet)?;
        let mut total = extractor.count().await?;
        if let Some(limit) = self.config.limit {
            total = total.min(limit as u64);
        }
        info!(phase = self.phase_name(), source = %extractor.describe(), total, "reading source");
        let phase = self.phase_name();
        if let Some(active) = self.active.as_mut() {
            active.progress.total = Some(total);
        }
        self.tracker.set_total(phase, total)?;
        let stream = extractor.extract().await?;
        Ok(RecordFeed {
            sheet,
            stream,
            limit: self.config.limit,
            taken: 0,
        })
    }

    /// Count one record's outcome, log it, and checkpoint.
    pub fn record(&mut self, record: &SourceRecord, outcome: RecordOutcome) -> Result<(), MigrationError> {
        self.record_row(record.sheet, record.row, Some(&record.external_id), outcome)
    }

    fn record_row(
        &mut self,
        sheet: &str,
        row: usize,
        external_id: Option<&str>,
        outcome: RecordOutcome,
    ) -> Result<(), MigrationError> {
        let phase = self.phase_name();
        let external_id = external_id.unwrap_or("-");
        let problem = match &outcome {
            RecordOutcome::Errored(cause) => {
                warn!(phase, sheet, row, external_id, error = %cause, "record failed");
                Some(format!("{sheet} row {row} [{external_id}]: {cause}"))
            }
            RecordOutcome::Skipped(reason @ SkipReason::UnresolvedReference { .. }) => {
                warn!(phase, sheet, row, external_id, reason = %reason, "record skipped");
                Some(format!("{sheet} row {row} [{external_id}]: {reason}"))
            }
            RecordOutcome::Skipped(reason) => {
                debug!(phase, sheet, row, external_id, reason = %reason, "record skipped");
                None
            }
            _ => None,
        };
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.stats.record(&outcome);
        active.progress.tick();
        let stats = active.stats;
        self.tracker.record(phase, &stats, problem)
    }

    fn note_blank(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.stats.blank_rows += 1;
        }
    }

    /// Commit early once `batch_size` writes are pending. No-op when the
    /// whole phase commits at once.
    pub async fn commit_if_full<T: Entity>(&mut self, set: &mut EntitySet<T>) -> Result<(), MigrationError> {
        let batch_size = self.config.batch_size;
        if batch_size > 0 && set.pending_len() >= batch_size {
            self.commit(set).await?;
        }
        Ok(())
    }

    /// Write every pending create and update, one transaction per batch.
    pub async fn commit<T: Entity>(&mut self, set: &mut EntitySet<T>) -> Result<(), MigrationError> {
        let phase = self.phase_name();
        loop {
            let mut pending = set.take_pending(self.config.batch_size)?;
            if pending.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut pending.batch);
            let (creates, updates) = (batch.creates.len(), batch.updates.len());
            let limit = self.config.write_timeout;
            let ids = tokio::time::timeout(limit, self.store.apply(batch))
                .await
                .map_err(|_| StoreError::Timeout(limit))??;
            info!(phase, kind = %T::KIND, creates, updates, dry_run = self.config.dry_run, "batch committed");
            set.acknowledge(pending, ids);
        }
    }

    pub async fn commit_links(&mut self, links: &mut LinkSet) -> Result<(), MigrationError> {
        let phase = self.phase_name();
        let batch = links.take_pending();
        if batch.is_empty() {
            return Ok(());
        }
        let (creates, updates) = (batch.creates.len(), batch.updates.len());
        let limit = self.config.write_timeout;
        tokio::time::timeout(limit, self.store.apply_links(batch))
            .await
            .map_err(|_| StoreError::Timeout(limit))??;
        info!(phase, kind = %links.kind(), creates, updates, dry_run = self.config.dry_run, "links committed");
        links.acknowledge();
        Ok(())
    }

    fn begin(&mut self, name: &'static str) -> Result<(), MigrationError> {
        self.tracker.start_phase(name, self.config.dry_run)?;
        self.active = Some(ActivePhase {
            name,
            stats: PhaseStats::default(),
            progress: Progress::new(name, self.config.progress_interval),
        });
        Ok(())
    }

    fn end(&mut self) -> PhaseStats {
        self.active.take().map(|a| a.stats).unwrap_or_default()
    }
}

/// Lazy record stream of one sheet. Blank, unreadable and identifier-less
/// rows are accounted for here and never reach the phase.
pub struct RecordFeed {
    sheet: &'static SheetSpec,
    stream: ExtractStream,
    limit: Option<usize>,
    taken: usize,
}

impl RecordFeed {
    pub async fn next(&mut self, ctx: &mut MigrationContext) -> Result<Option<SourceRecord>, MigrationError> {
        loop {
            if self.limit.is_some_and(|limit| self.taken >= limit) {
                return Ok(None);
            }
            let Some(item) = self.stream.next().await else {
                return Ok(None);
            };
            match item? {
                Extracted::Blank { .. } => ctx.note_blank(),
                Extracted::MissingIdentifier { row } => {
                    self.taken += 1;
                    ctx.record_row(
                        self.sheet.name,
                        row,
                        None,
                        RecordOutcome::Skipped(SkipReason::MissingIdentifier),
                    )?;
                }
                Extracted::Malformed { row, cause } => {
                    self.taken += 1;
                    ctx.record_row(self.sheet.name, row, None, RecordOutcome::Errored(cause))?;
                }
                Extracted::Record(record) => {
                    self.taken += 1;
                    return Ok(Some(record));
                }
            }
        }
    }
}

/// Outcome of one phase invocation, printed as the summary block.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSummary {
    pub phase: String,
    pub status: PhaseStatus,
    pub stats: PhaseStats,
    pub elapsed: Duration,
    pub dry_run: bool,
    /// Not run because the checkpoint already had it completed.
    pub already_completed: bool,
}

impl PhaseSummary {
    pub fn render(&self) -> String {
        let s = &self.stats;
        let mut out = format!(
            "==== phase {} ({}) ====\n\
             processed: {}  created: {}  updated: {}  merged: {}\n\
             skipped: {}  unresolved: {}  errors: {}  blank rows: {}\n\
             elapsed: {} ms",
            self.phase,
            self.status,
            s.processed,
            s.created,
            s.updated,
            s.merged,
            s.skipped,
            s.unresolved,
            s.errors,
            s.blank_rows,
            self.elapsed.as_millis()
        );
        if self.dry_run {
            out.push_str("  [DRY RUN]");
        }
        out
    }
}

/// Ordered phase registry.
pub struct PhaseRunner {
    phases: Vec<Box<dyn Phase>>,
}

impl PhaseRunner {
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Self {
        Self { phases }
    }

    /// Every migration phase in dependency order.
    pub fn standard() -> Self {
        Self::new(crate::phases::all())
    }

    pub fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    pub fn find(&self, name: &str) -> Option<&dyn Phase> {
        self.phases
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn missing_dependencies(&self, phase: &dyn Phase, tracker: &CheckpointTracker) -> Vec<String> {
        phase
            .dependencies()
            .iter()
            .filter(|dep| !tracker.is_completed(dep))
            .map(|dep| dep.to_string())
            .collect()
    }

    /// Phases the checkpoint does not have as completed, in order.
    pub fn pending(&self, tracker: &CheckpointTracker) -> Vec<String> {
        self.phases
            .iter()
            .filter(|p| !tracker.is_completed(p.name()))
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Run one phase: dependency check, start banner, body, checkpoint,
    /// summary. Record-level problems never fail the phase; store, source and
    /// dependency problems do.
    pub async fn run_phase(&self, ctx: &mut MigrationContext, name: &str) -> Result<PhaseSummary> {
        let phase = self
            .find(name)
            .ok_or_else(|| MigrationError::UnknownPhase(name.to_string()))?;
        let missing = self.missing_dependencies(phase, &ctx.tracker);
        if !missing.is_empty() {
            if ctx.config.force {
                warn!(phase = phase.name(), missing = ?missing, "dependencies not completed; continuing because of --force");
            } else {
                return Err(MigrationError::DependencyNotSatisfied {
                    phase: phase.name().to_string(),
                    missing,
                }
                .into());
            }
        }

        let started = Instant::now();
        info!(phase = phase.name(), dry_run = ctx.config.dry_run, description = phase.description(), "==== phase start ====");
        ctx.begin(phase.name())?;
        let result = phase.run(ctx).await;
        let stats = ctx.end();
        let (status, failure) = match &result {
            Ok(()) => (PhaseStatus::Completed, None),
            Err(err) => (PhaseStatus::Failed, Some(format!("{err:#}"))),
        };
        ctx.tracker.finish(phase.name(), status, &stats, failure)?;

        let summary = PhaseSummary {
            phase: phase.name().to_string(),
            status,
            stats,
            elapsed: started.elapsed(),
            dry_run: ctx.config.dry_run,
            already_completed: false,
        };
        println!("{}", summary.render());
        match &result {
            Ok(()) => info!(
                phase = phase.name(),
                processed = stats.processed,
                created = stats.created,
                updated = stats.updated,
                merged = stats.merged,
                skipped = stats.skipped,
                unresolved = stats.unresolved,
                errors = stats.errors,
                "==== phase end ===="
            ),
            Err(err) => error!(phase = phase.name(), error = %format!("{err:#}"), "==== phase failed ===="),
        }
        result?;
        Ok(summary)
    }

    /// Run the named phases in the order given.
    pub async fn run_selected(&self, ctx: &mut MigrationContext, names: &[String]) -> Result<Vec<PhaseSummary>> {
        let mut summaries = Vec::with_capacity(names.len());
        for name in names {
            summaries.push(self.run_phase(ctx, name).await?);
        }
        Ok(summaries)
    }

    /// Run every phase in order, skipping phases already completed unless
    /// `rerun_completed` is set. Stops at the first failed phase.
    pub async fn run_all(&self, ctx: &mut MigrationContext, rerun_completed: bool) -> Result<Vec<PhaseSummary>> {
        let mut summaries = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            if !rerun_completed && ctx.tracker.is_completed(phase.name()) {
                info!(phase = phase.name(), "already completed; skipping");
                let stats = ctx
                    .tracker
                    .phase(phase.name())
                    .map(|p| p.stats)
                    .unwrap_or_default();
                summaries.push(PhaseSummary {
                    phase: phase.name().to_string(),
                    status: PhaseStatus::Completed,
                    stats,
                    elapsed: Duration::ZERO,
                    dry_run: ctx.config.dry_run,
                    already_completed: true,
                });
                continue;
            }
            summaries.push(self.run_phase(ctx, phase.name()).await?);
        }
        Ok(summaries)
    }
}
