//! Post-migration count reconciliation. Read-only: compares source row
//! counts with what landed in the destination.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::model::{EntityKind, LinkKind};
use crate::runner::{MigrationContext, PhaseRunner};
use crate::source::sheets;
use crate::source::SheetSpec;

/// What a target's destination count is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCount {
    /// Entities carrying an import marker.
    Migrated(EntityKind),
    Links(LinkKind),
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationTarget {
    pub name: &'static str,
    pub sheet: &'static SheetSpec,
    pub count: TargetCount,
}

pub const TARGETS: [ValidationTarget; 7] = [
    ValidationTarget {
        name: "patient",
        sheet: &sheets::PATIENTS,
        count: TargetCount::Migrated(EntityKind::Patient),
    },
    ValidationTarget {
        name: "referrer",
        sheet: &sheets::REFERRERS,
        count: TargetCount::Migrated(EntityKind::Referrer),
    },
    ValidationTarget {
        name: "company",
        sheet: &sheets::COMPANIES,
        count: TargetCount::Migrated(EntityKind::Company),
    },
    ValidationTarget {
        name: "communication",
        sheet: &sheets::COMMUNICATIONS,
        count: TargetCount::Migrated(EntityKind::Communication),
    },
    ValidationTarget {
        name: "referral",
        sheet: &sheets::REFERRALS,
        count: TargetCount::Links(LinkKind::PatientReferrer),
    },
    ValidationTarget {
        name: "document",
        sheet: &sheets::DOCUMENTS,
        count: TargetCount::Migrated(EntityKind::Document),
    },
    ValidationTarget {
        name: "image",
        sheet: &sheets::IMAGES,
        count: TargetCount::Migrated(EntityKind::Image),
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub entity_type: String,
    pub source_count: u64,
    pub target_count: u64,
    /// `target_count - source_count`.
    pub delta: i64,
    pub tolerance: u64,
    pub within_tolerance: bool,
}

impl ValidationReport {
    pub fn new(entity_type: &str, source_count: u64, target_count: u64, tolerance: u64) -> Self {
        let delta = target_count as i64 - source_count as i64;
        Self {
            entity_type: entity_type.to_string(),
            source_count,
            target_count,
            delta,
            tolerance,
            within_tolerance: delta.unsigned_abs() <= tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub reports: Vec<ValidationReport>,
    pub passed: bool,
}

impl ValidationSummary {
    pub fn from_reports(reports: Vec<ValidationReport>) -> Self {
        let passed = reports.iter().all(|r| r.within_tolerance);
        Self { reports, passed }
    }

    pub fn failed(&self) -> Vec<String> {
        self.reports
            .iter()
            .filter(|r| !r.within_tolerance)
            .map(|r| r.entity_type.clone())
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("==== validation ====\n");
        for r in &self.reports {
            out.push_str(&format!(
                "{:<14} source: {:>7}  target: {:>7}  delta: {:>+6}  tolerance: {:>3}  {}\n",
                r.entity_type,
                r.source_count,
                r.target_count,
                r.delta,
                r.tolerance,
                if r.within_tolerance { "ok" } else { "MISMATCH" }
            ));
        }
        out.push_str(if self.passed { "result: PASS" } else { "result: FAIL" });
        out
    }
}

/// Reconcile one target. The source count is every non-blank row of the
/// sheet, including rows the phases skipped.
pub async fn reconcile(ctx: &MigrationContext, target: &ValidationTarget) -> Result<ValidationReport, MigrationError> {
    let source_count = ctx.sources().extractor(target.sheet)?.count().await?;
    let store = ctx.store();
    let target_count = match target.count {
        TargetCount::Migrated(kind) => store.count_migrated(kind).await?,
        TargetCount::Links(kind) => store.count_links(kind).await?,
    };
    let report = ValidationReport::new(
        target.name,
        source_count,
        target_count,
        ctx.config().tolerance_for(target.name),
    );
    if report.within_tolerance {
        info!(target = target.name, source = source_count, migrated = target_count, delta = report.delta, "counts reconciled");
    } else {
        warn!(
            target = target.name,
            source = source_count,
            migrated = target_count,
            delta = report.delta,
            tolerance = report.tolerance,
            "count mismatch beyond tolerance"
        );
    }
    Ok(report)
}

/// Reconcile every target. Requires every phase of `runner` to be
/// completed unless the run is forced.
pub async fn validate(ctx: &MigrationContext, runner: &PhaseRunner) -> Result<ValidationSummary, MigrationError> {
    let pending = runner.pending(ctx.tracker());
    if !pending.is_empty() {
        if !ctx.config().force {
            return Err(MigrationError::PhasesNotCompleted { pending });
        }
        warn!(pending = ?pending, "validating with incomplete phases because of --force");
    }
    let mut reports = Vec::with_capacity(TARGETS.len());
    for target in &TARGETS {
        reports.push(reconcile(ctx, target).await?);
    }
    Ok(ValidationSummary::from_reports(reports))
}
