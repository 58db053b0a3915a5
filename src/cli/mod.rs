//! Command-line interface for ocean-sync.
//!
//! Provides commands for running a sync, inspecting cursors and run
//! reports, resetting a source, and printing the resolved configuration.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use uuid::Uuid;

use crate::adapters::build_adapters;
use crate::config::{load_config, ResolvedConfig};
use crate::core::state_store::{
    FileStateStore, SqliteStateStore, StateBackendKind, SyncStateStore,
};
use crate::core::{Orchestrator, RunLog};
use crate::domain::{RunOutcome, SourceId, SourceState, SyncRun, Watermark};
use crate::sink::{MemorySink, Sink, SqliteSink};

/// Exit code when the run was interrupted with Ctrl-C
pub const EXIT_INTERRUPTED: i32 = 130;

/// ocean-sync - incremental oceanographic data synchronization
#[derive(Parser, Debug)]
#[command(name = "ocean-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .ocean-sync/config.yaml in this or a parent directory)
    #[arg(short, long, global = true, env = "OCEAN_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synchronize every enabled source
    Sync {
        /// Only these sources (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        sources: Option<Vec<String>>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Fetch and normalize without writing observations or cursors
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the cursor of every source
    Status,

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show one run report
    Show {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Forget a source's cursor so the next sync starts over
    Reset {
        /// Source id (noaa, copernicus, argo, ncei)
        source: String,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub async fn execute(self) -> Result<i32> {
        let config = load_config(self.config.as_deref())?;

        match self.command {
            Commands::Sync {
                sources,
                json,
                dry_run,
            } => run_sync(config, sources, json, dry_run).await,
            Commands::Status => show_status(&config).await.map(|_| 0),
            Commands::Runs { limit } => list_runs(&config, limit).await.map(|_| 0),
            Commands::Show { run_id } => show_run(&config, &run_id).await.map(|_| 0),
            Commands::Reset { source } => reset_source(&config, &source).await.map(|_| 0),
            Commands::Config => show_config(&config).map(|_| 0),
        }
    }
}

/// Open the configured cursor store
async fn open_state_store(config: &ResolvedConfig) -> Result<Arc<dyn SyncStateStore>> {
    let store: Arc<dyn SyncStateStore> = match config.settings.state.backend {
        StateBackendKind::File => Arc::new(
            FileStateStore::open(config.state_dir())
                .await
                .with_context(|| format!("Failed to open state directory: {}", config.state_dir().display()))?,
        ),
        StateBackendKind::Sqlite => Arc::new(
            SqliteStateStore::open(&config.database_path())
                .with_context(|| format!("Failed to open state database: {}", config.database_path().display()))?,
        ),
    };
    Ok(store)
}

/// Hold an exclusive lock on the home directory for the duration of a sync
fn acquire_lock(config: &ResolvedConfig) -> Result<File> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("Failed to create home directory: {}", config.home.display()))?;

    let path = config.lock_path();
    let file = File::create(&path)
        .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("Another sync is running (lock held on {})", path.display()))?;
    Ok(file)
}

/// Run a sync and report it
async fn run_sync(
    mut config: ResolvedConfig,
    sources: Option<Vec<String>>,
    json: bool,
    dry_run: bool,
) -> Result<i32> {
    if let Some(only) = sources {
        config.settings = config.settings.restrict_sources(&only)?;
    }

    let lock = acquire_lock(&config)?;
    let adapters = build_adapters(&config)?;
    let durable_state = open_state_store(&config).await?;

    let (state, sink): (Arc<dyn SyncStateStore>, Arc<dyn Sink>) = if dry_run {
        // Start from the real cursors but never write them back
        let scratch = SqliteStateStore::in_memory()?;
        for (source, cursor) in durable_state.list().await? {
            scratch.commit(&source, &cursor).await?;
        }
        (Arc::new(scratch), Arc::new(MemorySink::new()))
    } else {
        let sink = SqliteSink::open(&config.database_path())
            .with_context(|| format!("Failed to open database: {}", config.database_path().display()))?;
        (durable_state, Arc::new(sink))
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let shutdown = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
            eprintln!("\nInterrupted, cancelling sources...");
        } else {
            std::future::pending::<()>().await;
        }
    };

    let orchestrator = Orchestrator::new(&config.settings, adapters, state, sink.clone());
    let run = orchestrator.run_until(shutdown).await;

    if !dry_run {
        let log = RunLog::open(config.runs_dir()).await?;
        log.record(&run).await?;
    }
    drop(lock);

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
        if dry_run {
            println!("\n[dry run: {} records kept in memory, nothing written]", sink.count().await?);
        }
    }

    if interrupted.load(Ordering::SeqCst) {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(run.outcome.exit_code())
}

fn print_run(run: &SyncRun) {
    println!("Run ID:   {}", run.id);
    println!("Outcome:  {:?}", run.outcome);
    println!("Duration: {}ms", run.duration_ms);
    println!();
    println!(
        "{:<12} {:<11} {:>7} {:>7} {:>10} {:>7} {:>7} {:>8} {:>8}",
        "SOURCE", "STATE", "LISTED", "FETCHED", "NORMALIZED", "MERGED", "DEDUPED", "WRITTEN", "REJECTED"
    );
    println!("{}", "-".repeat(87));

    for report in run.sources.values() {
        let c = &report.counts;
        println!(
            "{:<12} {:<11} {:>7} {:>7} {:>10} {:>7} {:>7} {:>8} {:>8}",
            report.source,
            report.state.label(),
            c.listed,
            c.fetched,
            c.normalized,
            c.merged,
            c.deduped,
            c.written,
            c.rejected
        );
        if c.deferred > 0 {
            println!("  deferred: {} item(s) not published yet", c.deferred);
        }
        if let SourceState::Failed { reason, retryable } = &report.state {
            println!("  reason: {} (retryable: {})", reason, retryable);
        }
    }
}

/// Show cursors
async fn show_status(config: &ResolvedConfig) -> Result<()> {
    let store = open_state_store(config).await?;
    let cursors = store.list().await?;

    println!(
        "{:<12} {:<26} {:<26} {:>8}",
        "SOURCE", "WATERMARK", "LAST SUCCESS", "FAILURES"
    );
    println!("{}", "-".repeat(75));

    for source in &config.settings.sources {
        let cursor = cursors
            .get(&SourceId::new(source.as_str()))
            .cloned()
            .unwrap_or_default();
        let watermark = match &cursor.watermark {
            Some(Watermark::Timestamp(ts)) => ts.to_rfc3339(),
            Some(Watermark::Token(token)) => token.clone(),
            None => "(never synced)".to_string(),
        };
        let last_success = cursor
            .last_success
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<26} {:<26} {:>8}",
            source, watermark, last_success, cursor.consecutive_failures
        );
    }

    Ok(())
}

/// List recent runs
async fn list_runs(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let log = RunLog::open(config.runs_dir()).await?;
    let runs = log.recent(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<26} {:<10} {:>8}", "RUN ID", "STARTED", "OUTCOME", "WRITTEN");
    println!("{}", "-".repeat(85));

    for run in runs {
        let outcome = match &run.outcome {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed { .. } => "failed",
        };
        println!(
            "{:<38} {:<26} {:<10} {:>8}",
            run.id,
            run.started_at.to_rfc3339(),
            outcome,
            run.totals().written
        );
    }

    Ok(())
}

/// Show one run report
async fn show_run(config: &ResolvedConfig, run_id_str: &str) -> Result<()> {
    let run_id =
        Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let log = RunLog::open(config.runs_dir()).await?;
    let run = log
        .load(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    print_run(&run);
    for report in run.sources.values() {
        if report.rejections.is_empty() {
            continue;
        }
        println!("\nRejections for {} ({} total):", report.source, report.counts.rejected);
        for r in &report.rejections {
            println!("  [{:?}] {}: {}", r.stage, r.native_id, r.error);
        }
    }

    Ok(())
}

/// Zero a source's cursor
async fn reset_source(config: &ResolvedConfig, source: &str) -> Result<()> {
    let _lock = acquire_lock(config)?;
    let store = open_state_store(config).await?;

    if store.reset(&SourceId::new(source)).await? {
        println!("Cursor for '{}' reset; the next sync starts from scratch", source);
    } else {
        println!("No cursor stored for '{}'", source);
    }
    Ok(())
}

/// Show the resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", config.home.display());
    println!("  State:    {}", config.state_dir().display());
    println!("  Database: {}", config.database_path().display());
    println!("  Runs:     {}", config.runs_dir().display());
    println!();
    println!("Credentials:");
    for source in &config.settings.sources {
        let status = if config.credentials(source).is_some() {
            "set"
        } else {
            "not set"
        };
        println!("  {:<12} {}", source, status);
    }
    println!();
    println!("Settings:");
    print!(
        "{}",
        serde_yaml::to_string(&config.settings).context("Failed to render settings")?
    );

    Ok(())
}
