use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use practice_migrate::checkpoint::CheckpointTracker;
use practice_migrate::config::MigrationConfig;
use practice_migrate::error::MigrationError;
use practice_migrate::runner::{MigrationContext, PhaseRunner};
use practice_migrate::source::{SheetSpec, SourceSet};
use practice_migrate::tracing::{init_tracing, DEFAULT_FILTER};
use practice_migrate::util::env as env_util;
use practice_migrate::{store, validate};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "practice-migrate",
    version,
    about = "Migrate a legacy practice-management export into the clinic store"
)]
struct Cli {
    #[command(flatten)]
    opts: RunOpts,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunOpts {
    /// Run everything but write nothing (store or checkpoint)
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
    /// Source override: a directory of CSV sheets, or one sheet file for a single phase
    #[arg(long = "excel-file", alias = "file", global = true)]
    excel_file: Option<PathBuf>,
    /// Stop each phase after this many records
    #[arg(long, global = true)]
    limit: Option<usize>,
    /// Run phases whose dependencies are not completed
    #[arg(long, global = true, default_value_t = false)]
    force: bool,
    /// Checkpoint file (default: MIGRATION_CHECKPOINT or migration_checkpoint.json)
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,
    /// Destination URL; `memory` selects the in-process store
    #[arg(long, global = true)]
    db_url: Option<String>,
    /// Entities per write transaction; 0 writes each phase at once
    #[arg(long, global = true)]
    batch_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run every phase in dependency order, then validate
    Run {
        /// Also rerun phases the checkpoint has as completed
        #[arg(long, default_value_t = false)]
        rerun: bool,
        /// Exit non-zero when validation finds a mismatch
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Run the named phases, in the order given
    Phase {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print the checkpoint
    Status,
    /// Reconcile source and destination counts
    Validate {
        /// Exit non-zero when validation finds a mismatch
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// List phases with their dependencies and checkpoint status
    List,
}

impl RunOpts {
    fn apply(&self, config: &mut MigrationConfig) {
        config.dry_run |= self.dry_run;
        config.force |= self.force;
        if let Some(path) = &self.excel_file {
            config.source = path.clone();
        }
        if self.limit.is_some() {
            config.limit = self.limit;
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint = path.clone();
        }
        if let Some(url) = &self.db_url {
            config.db_url = url.clone();
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
    }
}

/// Sheet a single-file source binds to. Only one phase may be selected, or
/// several that all read the same sheet.
fn file_override(
    config: &MigrationConfig,
    runner: &PhaseRunner,
    names: &[String],
) -> Result<Option<&'static SheetSpec>> {
    if !config.source.is_file() {
        return Ok(None);
    }
    let mut sheets = Vec::new();
    for name in names {
        let phase = runner
            .find(name)
            .ok_or_else(|| MigrationError::UnknownPhase(name.clone()))?;
        sheets.push(phase.sheet());
    }
    match sheets.as_slice() {
        [first, rest @ ..] if rest.iter().all(|s| s.name == first.name) => Ok(Some(*first)),
        _ => bail!(
            "--excel-file {} is a single sheet; select one phase, or pass a directory",
            config.source.display()
        ),
    }
}

async fn open_context(config: MigrationConfig, sheet: Option<&'static SheetSpec>) -> Result<MigrationContext> {
    let tracker = if config.dry_run {
        CheckpointTracker::detached(&config.checkpoint, config.max_recorded_errors)?
    } else {
        CheckpointTracker::load_or_new(&config.checkpoint, config.max_recorded_errors)?
    };
    let mut sources = SourceSet::from_config(&config).context("open source")?;
    if let Some(sheet) = sheet {
        sources.override_sheet(sheet, config.source.clone())?;
    }
    let store = store::open(&config.db_url)
        .await
        .with_context(|| format!("open destination store {}", config.db_url))?;
    Ok(MigrationContext::new(config, store, sources, tracker))
}

async fn run_validation(ctx: &MigrationContext, runner: &PhaseRunner, strict: bool) -> Result<()> {
    let summary = validate::validate(ctx, runner).await?;
    println!("{}", summary.render());
    if !summary.passed {
        let failed = summary.failed();
        if strict {
            return Err(MigrationError::ValidationMismatch { failed }.into());
        }
        warn!(failed = ?failed, "validation mismatch; rerun with --strict to fail the run");
    }
    Ok(())
}

fn print_status(tracker: &CheckpointTracker, runner: &PhaseRunner) {
    let state = tracker.snapshot();
    println!("checkpoint started {}  last update {}", state.start_time, state.last_update);
    if let Some(current) = &state.current_phase {
        println!("current phase: {current}");
    }
    for phase in runner.phases() {
        match tracker.phase(phase.name()) {
            Some(cp) => {
                let total = cp.total_items.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
                println!(
                    "{:<28} {:<12} {:>6}/{:<6} ok: {:<6} skipped: {:<6} errors: {:<6}{}",
                    phase.name(),
                    cp.status.as_str(),
                    cp.processed,
                    total,
                    cp.success_count,
                    cp.skipped_count,
                    cp.error_count,
                    if cp.dry_run { " [DRY RUN]" } else { "" }
                );
                for err in cp.errors.iter().take(5) {
                    println!("    {err}");
                }
                if cp.errors.len() > 5 {
                    println!("    ... {} more", cp.errors.len() - 5);
                }
            }
            None => println!("{:<28} {}", phase.name(), tracker.status(phase.name()).as_str()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    let mut config = MigrationConfig::from_env();
    cli.opts.apply(&mut config);
    env_util::log_snapshot(
        "practice-migrate",
        &[
            "MIGRATION_SOURCE",
            "MIGRATION_DB_URL",
            "DATABASE_URL",
            "MIGRATION_CHECKPOINT",
            "MIGRATION_BATCH_SIZE",
            "SOURCE_API_URL",
            "SOURCE_API_KEY",
            "VALIDATION_TOLERANCE",
        ],
    );
    let runner = PhaseRunner::standard();

    match cli.command {
        Commands::Run { rerun, strict } => {
            if config.source.is_file() {
                bail!("`run` reads every sheet; pass a directory to --excel-file");
            }
            let dry_run = config.dry_run;
            let mut ctx = open_context(config, None).await?;
            let summaries = runner.run_all(&mut ctx, rerun).await?;
            info!(phases = summaries.len(), dry_run, "all phases finished");
            // A dry run validates its scratch copy of the destination.
            run_validation(&ctx, &runner, strict).await?;
        }
        Commands::Phase { names } => {
            let sheet = file_override(&config, &runner, &names)?;
            let mut ctx = open_context(config, sheet).await?;
            runner.run_selected(&mut ctx, &names).await?;
        }
        Commands::Status => {
            let tracker = CheckpointTracker::detached(&config.checkpoint, config.max_recorded_errors)?;
            print_status(&tracker, &runner);
        }
        Commands::Validate { strict } => {
            if config.source.is_file() {
                bail!("`validate` reads every sheet; pass a directory to --excel-file");
            }
            let ctx = open_context(config, None).await?;
            run_validation(&ctx, &runner, strict).await?;
        }
        Commands::List => {
            let tracker = CheckpointTracker::detached(&config.checkpoint, config.max_recorded_errors)?;
            for phase in runner.phases() {
                let deps = if phase.dependencies().is_empty() {
                    "-".to_string()
                } else {
                    phase.dependencies().join(", ")
                };
                println!(
                    "{:<28} {:<12} needs: {:<40} {}",
                    phase.name(),
                    tracker.status(phase.name()).as_str(),
                    deps,
                    phase.description()
                );
            }
        }
    }
    Ok(())
}
