//! # Mailflow CLI (`mfl`)
//!
//! The `mfl` binary drives the email-analysis pipeline. It provides commands
//! for database initialization, email ingestion, batch analysis, coverage
//! stats, and checkpoint management.
//!
//! ## Usage
//!
//! ```bash
//! mfl --config ./config/mailflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mfl init` | Create the SQLite database and run schema migrations |
//! | `mfl ingest <file.jsonl>` | Seed items from a JSON-Lines email export |
//! | `mfl analyze` | Run the adaptive multi-phase analysis pipeline |
//! | `mfl stats` | Print corpus and coverage statistics |
//! | `mfl checkpoint list` | Show open (resumable) checkpoints |
//! | `mfl checkpoint clear` | Delete a checkpoint to force a fresh run |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! mfl init --config ./config/mailflow.toml
//!
//! # Seed emails, then analyze everything pending
//! mfl ingest exports/q3.jsonl
//! mfl analyze
//!
//! # Extraction-only pass over the first 100 chains, no external calls
//! mfl analyze --extract-only --limit 100
//!
//! # Preview routing decisions without writing anything
//! mfl analyze --dry-run
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use mailflow::pipeline::{self, AnalyzeOptions};
use mailflow::progress::ProgressMode;
use mailflow::{checkpoint, config, db, enrich, ingest_jsonl, migrate, stats};

/// Mailflow CLI — an adaptive analysis pipeline turning email chains into
/// structured workflow intelligence.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mailflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mfl",
    about = "Mailflow — adaptive multi-phase analysis for email chains",
    version,
    long_about = "Mailflow ingests email exports into SQLite, scores each conversation chain's \
    completeness, and routes every email through one, two, or three analysis phases. Phase 1 is \
    local extraction; phases 2 and 3 call an external language-model provider and merge its output \
    into the baseline. Batch runs checkpoint progress and resume after interruption."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/mailflow.toml`. Database, scoring, routing,
    /// enrichment, and batch settings are read from this file.
    #[arg(long, global = true, default_value = "./config/mailflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (items,
    /// analysis, checkpoints, run_summary). This command is idempotent —
    /// running it multiple times is safe.
    Init,

    /// Ingest emails from a JSON-Lines export.
    ///
    /// One JSON object per line with `chain_key`, `subject`, `body`,
    /// `sender`, and `received_at` (Unix seconds). Records upsert by id;
    /// re-ingesting a file never disturbs already-analyzed items.
    Ingest {
        /// Path to the `.jsonl` export file.
        file: PathBuf,

        /// Maximum number of records to ingest.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run the analysis pipeline over pending chains.
    ///
    /// Scores each chain, routes items through phases 1–3, and persists
    /// results transactionally. Interrupting with Ctrl-C checkpoints
    /// progress; the next run resumes where this one stopped.
    Analyze {
        /// Maximum number of chains to process this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Number of pending chains to skip before processing.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Ignore any existing checkpoint and start fresh.
        #[arg(long)]
        no_resume: bool,

        /// Run all three phases for every item regardless of routing.
        #[arg(long)]
        force_all_phases: bool,

        /// Phase 1 only — no external enrichment calls.
        #[arg(long)]
        extract_only: bool,

        /// Override the configured batch size (chains per batch).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show candidate counts and planned phase calls without writing.
        #[arg(long)]
        dry_run: bool,

        /// Progress output: `off`, `human`, or `json` (stderr).
        /// Defaults to `human` when stderr is a terminal, else `off`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Print database and analysis-coverage statistics.
    Stats,

    /// Manage batch-run checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

/// Checkpoint management subcommands.
#[derive(Subcommand)]
enum CheckpointAction {
    /// List open checkpoints and their progress.
    List,
    /// Delete a checkpoint so the next analyze run starts fresh.
    Clear {
        /// Operation id to clear. Defaults to `batch.operation_id` from config.
        #[arg(long)]
        operation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, limit } => {
            ingest_jsonl::run_ingest(&cfg, &file, limit).await?;
        }
        Commands::Analyze {
            limit,
            offset,
            no_resume,
            force_all_phases,
            extract_only,
            batch_size,
            dry_run,
            progress,
        } => {
            let mode = match progress.as_deref() {
                Some(s) => ProgressMode::parse(s)
                    .ok_or_else(|| anyhow::anyhow!("invalid --progress value: '{}'", s))?,
                None => ProgressMode::default_for_tty(),
            };
            let opts = AnalyzeOptions {
                limit,
                offset,
                resume: !no_resume,
                force_all_phases,
                extract_only,
                batch_size,
                dry_run,
            };
            run_analyze_command(&cfg, &opts, mode).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::List => {
                let pool = db::connect(&cfg).await?;
                let checkpoints = checkpoint::list_checkpoints(&pool).await?;
                if checkpoints.is_empty() {
                    println!("No open checkpoints.");
                } else {
                    for cp in &checkpoints {
                        println!(
                            "{} / {}  {:.1}%  {} / {} items ({} errors), updated {}",
                            cp.operation_id,
                            cp.stage_name,
                            cp.progress_pct,
                            cp.completed,
                            cp.total,
                            cp.errors,
                            stats::format_ts_relative(cp.updated_at)
                        );
                    }
                }
                pool.close().await;
            }
            CheckpointAction::Clear { operation } => {
                let pool = db::connect(&cfg).await?;
                let operation_id = operation.unwrap_or_else(|| cfg.batch.operation_id.clone());
                checkpoint::clear_checkpoint(&pool, &operation_id, pipeline::STAGE_NAME).await?;
                println!("Checkpoint cleared for operation '{}'.", operation_id);
                pool.close().await;
            }
        },
    }

    Ok(())
}

async fn run_analyze_command(
    cfg: &config::Config,
    opts: &AnalyzeOptions,
    mode: ProgressMode,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let enricher = enrich::create_enricher(&cfg.enrichment)?;
    let reporter = mode.reporter();

    // Ctrl-C requests a graceful stop; the run finishes its current batch,
    // flushes a checkpoint, and exits non-zero.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let outcome =
        pipeline::run_analyze(cfg, opts, &pool, enricher, reporter.as_ref(), cancel_rx).await?;

    pool.close().await;

    if opts.dry_run {
        return Ok(());
    }

    println!("Analyze complete:");
    println!("  items analyzed:  {}", outcome.completed);
    println!("  item errors:     {}", outcome.errors);
    println!("  phase 2 runs:    {}", outcome.phase2_runs);
    println!("  phase 3 runs:    {}", outcome.phase3_runs);
    println!("  retries:         {}", outcome.retries);
    println!("  fallbacks:       {}", outcome.fallbacks);
    println!("  elapsed:         {:.1}s", outcome.elapsed_secs);

    if outcome.interrupted {
        bail!("run interrupted; progress checkpointed — re-run `mfl analyze` to resume");
    }

    Ok(())
}
