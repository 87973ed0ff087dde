//! Batch orchestration: the end-to-end analyze run.
//!
//! Pulls candidate chains from the store in fixed-size batches, scores each
//! chain once per cycle, routes every pending item through 1–3 analysis
//! phases, and persists each item's result in a single transaction. The run
//! is resumable (checkpoint per operation id), retry-disciplined (one
//! injected policy for gateway and datastore calls), cancellable between
//! batches, and bounded in memory — the full working set is never
//! materialized.
//!
//! Item-level failures are isolated and counted; only startup problems
//! (unreachable database, corrupt checkpoint) abort the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::chains::group_into_chains;
use crate::checkpoint;
use crate::completeness::score_chain;
use crate::config::{Config, RoutingConfig, ScoringConfig};
use crate::enrich::{EnrichError, EnrichOutcome, EnrichRequest, Enricher, Stage};
use crate::extract;
use crate::merge::merge_enrichment;
use crate::models::{
    AnalysisResult, Checkpoint, CheckpointState, Item, ItemStatus, ValueSignal,
};
use crate::progress::{AnalyzeProgressEvent, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::router::{select_phases, RoutingOverrides};
use crate::store::{self, PhaseSnapshots};

/// Stage name under which analyze runs checkpoint.
pub const STAGE_NAME: &str = "analyze";

/// CLI-level options for one analyze run.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Maximum chains to process this run.
    pub limit: Option<usize>,
    /// Pending chains to skip before the first batch.
    pub offset: usize,
    /// Resume from an existing checkpoint instead of starting fresh.
    pub resume: bool,
    pub force_all_phases: bool,
    pub extract_only: bool,
    pub batch_size: Option<usize>,
    pub dry_run: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            resume: true,
            force_all_phases: false,
            extract_only: false,
            batch_size: None,
            dry_run: false,
        }
    }
}

/// Final accounting for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub completed: u64,
    pub errors: u64,
    pub phase2_runs: u64,
    pub phase3_runs: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub interrupted: bool,
    pub elapsed_secs: f64,
}

/// Per-chain counters returned by worker tasks.
#[derive(Debug, Default, Clone, Copy)]
struct ChainStats {
    completed: u64,
    errors: u64,
    phase2_runs: u64,
    phase3_runs: u64,
    retries: u64,
    fallbacks: u64,
}

/// Drive a full analyze run. See module docs for the state machine.
pub async fn run_analyze(
    config: &Config,
    opts: &AnalyzeOptions,
    pool: &SqlitePool,
    enricher: Arc<dyn Enricher>,
    reporter: &dyn ProgressReporter,
    cancel: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let operation_id = config.batch.operation_id.clone();
    let batch_size = opts.batch_size.unwrap_or(config.batch.size).max(1);

    let overrides = RoutingOverrides {
        force_all_phases: opts.force_all_phases,
        // A disabled provider is an implicit extraction-only run.
        extract_only: opts.extract_only || !config.enrichment.is_enabled(),
    };

    reporter.report(AnalyzeProgressEvent::Scanning {
        operation: operation_id.clone(),
    });

    if opts.dry_run {
        return dry_run(config, opts, pool, &overrides).await;
    }

    // One policy for every gateway and datastore call in the run; lock
    // contention never aborts anything until the budget is exhausted.
    let retry = RetryPolicy::new(config.enrichment.max_retries, Duration::from_secs(1));
    let semaphore = Arc::new(Semaphore::new(config.enrichment.concurrency.max(1)));

    // Resume or start fresh. A corrupt checkpoint aborts here, before any
    // work — never silently restart over committed progress.
    let mut state = CheckpointState::default();
    let mut completed: u64 = 0;
    let mut errors: u64 = 0;
    if opts.resume {
        let loaded = retry
            .run(
                || checkpoint::load_checkpoint(pool, &operation_id, STAGE_NAME),
                store::is_transient_db_error,
            )
            .await;
        if let Some(cp) = loaded.result.context("loading checkpoint")? {
            completed = cp.completed.max(0) as u64;
            errors = cp.errors.max(0) as u64;
            state = cp.state;
            eprintln!(
                "Resuming operation '{}' from checkpoint: {} items done, cursor {:?}",
                operation_id, completed, state.cursor
            );
        }
        state.retries += loaded.retries as i64;
    } else {
        let cleared = retry
            .run(
                || checkpoint::clear_checkpoint(pool, &operation_id, STAGE_NAME),
                store::is_transient_db_error,
            )
            .await;
        cleared.result?;
    }

    let counted = retry
        .run(|| store::count_pending_items(pool), store::is_transient_db_error)
        .await;
    state.retries += counted.retries as i64;
    let pending_items = counted.result? as u64;
    let total_items = completed + errors + pending_items;

    let mut cursor = state.cursor.clone();
    let mut first_page_offset = opts.offset;
    let mut chains_this_run: usize = 0;
    let mut items_since_checkpoint: u64 = 0;
    let mut fallbacks: u64 = 0;
    let mut interrupted = false;

    loop {
        // Cancellation is honored between batches, never mid-batch.
        if *cancel.borrow() {
            interrupted = true;
            break;
        }

        if let Some(rss_mb) = over_memory_ceiling(config.batch.memory_ceiling_mb) {
            eprintln!(
                "Warning: resident memory {} MB exceeds the {} MB ceiling; stopping after checkpoint",
                rss_mb, config.batch.memory_ceiling_mb
            );
            interrupted = true;
            break;
        }

        let page = match opts.limit {
            Some(limit) if chains_this_run >= limit => break,
            Some(limit) => batch_size.min(limit - chains_this_run),
            None => batch_size,
        };

        let paged = retry
            .run(
                || store::pending_chain_keys(pool, cursor.as_deref(), page, first_page_offset),
                store::is_transient_db_error,
            )
            .await;
        state.retries += paged.retries as i64;
        let keys = paged.result?;
        first_page_offset = 0;
        let Some(last_key) = keys.last().cloned() else {
            break;
        };

        let mut workers: JoinSet<Result<ChainStats>> = JoinSet::new();
        for chain_key in keys.iter().cloned() {
            let pool = pool.clone();
            let enricher = Arc::clone(&enricher);
            let semaphore = Arc::clone(&semaphore);
            let scoring = config.scoring.clone();
            let routing = config.routing.clone();
            workers.spawn(async move {
                process_chain(
                    &pool, enricher, semaphore, retry, &scoring, &routing, overrides, chain_key,
                )
                .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let chain_stats = joined.context("chain worker panicked")??;
            completed += chain_stats.completed;
            errors += chain_stats.errors;
            state.phase2_runs += chain_stats.phase2_runs as i64;
            state.phase3_runs += chain_stats.phase3_runs as i64;
            state.retries += chain_stats.retries as i64;
            state.chains_done += 1;
            fallbacks += chain_stats.fallbacks;
            items_since_checkpoint += chain_stats.completed + chain_stats.errors;

            reporter.report(AnalyzeProgressEvent::Processing {
                operation: operation_id.clone(),
                completed,
                total: total_items,
                errors,
            });
        }

        chains_this_run += keys.len();
        cursor = Some(last_key);
        state.cursor = cursor.clone();

        // The batch above is fully committed; the checkpoint may now claim it.
        if items_since_checkpoint >= config.batch.checkpoint_interval {
            flush_checkpoint(pool, &operation_id, &state, completed, errors, total_items, &retry)
                .await?;
            reporter.report(AnalyzeProgressEvent::Checkpointed {
                operation: operation_id.clone(),
                completed,
            });
            items_since_checkpoint = 0;
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    let outcome = RunOutcome {
        completed,
        errors,
        phase2_runs: state.phase2_runs.max(0) as u64,
        phase3_runs: state.phase3_runs.max(0) as u64,
        retries: state.retries.max(0) as u64,
        fallbacks,
        interrupted,
        elapsed_secs,
    };

    if interrupted {
        // Flush the final checkpoint so the run can resume exactly here.
        flush_checkpoint(pool, &operation_id, &state, completed, errors, total_items, &retry)
            .await?;
        return Ok(outcome);
    }

    // Full completion: audit row, then the checkpoint goes away.
    let summarized = retry
        .run(
            || {
                store::write_run_summary(
                    pool,
                    &operation_id,
                    (completed + errors) as i64,
                    completed as i64,
                    errors as i64,
                    state.phase2_runs,
                    state.phase3_runs,
                    elapsed_secs,
                )
            },
            store::is_transient_db_error,
        )
        .await;
    summarized.result?;
    let cleared = retry
        .run(
            || checkpoint::clear_checkpoint(pool, &operation_id, STAGE_NAME),
            store::is_transient_db_error,
        )
        .await;
    cleared.result?;

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn flush_checkpoint(
    pool: &SqlitePool,
    operation_id: &str,
    state: &CheckpointState,
    completed: u64,
    errors: u64,
    total: u64,
    retry: &RetryPolicy,
) -> Result<()> {
    let progress_pct = if total > 0 {
        (completed + errors) as f64 * 100.0 / total as f64
    } else {
        100.0
    };
    let cp = Checkpoint {
        operation_id: operation_id.to_string(),
        stage_name: STAGE_NAME.to_string(),
        state: state.clone(),
        progress_pct,
        completed: completed as i64,
        total: total as i64,
        errors: errors as i64,
        updated_at: 0, // overwritten at write time
    };
    let saved = retry
        .run(
            || checkpoint::save_checkpoint(pool, &cp),
            store::is_transient_db_error,
        )
        .await;
    saved.result
}

/// Resident set in MB when a ceiling is configured and exceeded. Best
/// effort: on platforms without /proc the check never fires.
fn over_memory_ceiling(ceiling_mb: u64) -> Option<u64> {
    if ceiling_mb == 0 {
        return None;
    }
    let rss_mb = resident_set_bytes()? / (1024 * 1024);
    if rss_mb > ceiling_mb {
        Some(rss_mb)
    } else {
        None
    }
}

/// Resident set size from /proc/self/statm (field 2, 4 KiB pages).
fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

/// Process one chain: score once, then run each pending item through its
/// routed phases in timestamp order. A chain never spans workers, so no
/// two tasks race on the same persisted row.
#[allow(clippy::too_many_arguments)]
async fn process_chain(
    pool: &SqlitePool,
    enricher: Arc<dyn Enricher>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    scoring: &ScoringConfig,
    routing: &RoutingConfig,
    overrides: RoutingOverrides,
    chain_key: String,
) -> Result<ChainStats> {
    let mut stats = ChainStats::default();

    let loaded = retry
        .run(
            || store::load_chain_items(pool, &chain_key),
            store::is_transient_db_error,
        )
        .await;
    stats.retries += loaded.retries as u64;
    let items = loaded.result?;
    let Some(chain) = group_into_chains(items).into_iter().next() else {
        return Ok(stats);
    };

    // One scoring pass per chain per cycle; deterministic for the snapshot.
    let analysis = score_chain(&chain, scoring);

    for item in chain.items.iter().filter(|i| i.status == ItemStatus::Pending) {
        // Phase 1 always runs, locally.
        let mut result = extract::analyze_item(item);
        let mut snapshots = PhaseSnapshots {
            phase1: serde_json::to_string(&result)?,
            ..Default::default()
        };

        let signal = ValueSignal {
            dollar_value: result.max_dollar_value(),
            urgency: result.urgency,
        };
        let plan = select_phases(&analysis, &signal, routing, &overrides);

        if plan.run_phase2 {
            match enrich_with_retry(&*enricher, &semaphore, &retry, item, &result, Stage::Two, &mut stats)
                .await
            {
                Ok(outcome) => {
                    log_outcome_quality(&item.id, Stage::Two, &outcome);
                    merge_enrichment(&mut result, &outcome, Stage::Two);
                    snapshots.phase2 = Some(serde_json::to_string(&result)?);
                    stats.phase2_runs += 1;
                }
                Err(e) => {
                    // Fall back to the phase-1 result; nothing is lost.
                    eprintln!(
                        "Warning: phase 2 enrichment failed for {} ({}); keeping phase-1 result",
                        item.id, e
                    );
                    stats.fallbacks += 1;
                }
            }
        }

        // Phase 3 builds on a validated phase 2; skip it when phase 2 fell
        // back so the strategic pass never sees unvalidated state.
        if plan.run_phase3 && result.phases_run >= 2 {
            match enrich_with_retry(&*enricher, &semaphore, &retry, item, &result, Stage::Three, &mut stats)
                .await
            {
                Ok(outcome) => {
                    log_outcome_quality(&item.id, Stage::Three, &outcome);
                    merge_enrichment(&mut result, &outcome, Stage::Three);
                    snapshots.phase3 = Some(serde_json::to_string(&result)?);
                    stats.phase3_runs += 1;
                }
                Err(e) => {
                    eprintln!(
                        "Warning: phase 3 enrichment failed for {} ({}); keeping phase-2 result",
                        item.id, e
                    );
                    stats.fallbacks += 1;
                }
            }
        }

        // Atomic persist: status fields + analysis row, or neither.
        let persisted = retry
            .run(
                || store::persist_item_result(pool, &item.id, &result, &analysis, &snapshots),
                store::is_transient_db_error,
            )
            .await;
        stats.retries += persisted.retries as u64;

        match persisted.result {
            Ok(()) => stats.completed += 1,
            Err(e) if store::is_transient_db_error(&e) => {
                // Contention outlasted the retry budget.
                eprintln!("Warning: persist exhausted retries for {}: {}", item.id, e);
                let _ = store::mark_item_error(pool, &item.id).await;
                stats.errors += 1;
            }
            Err(e) => {
                // Constraint violation or schema mismatch: rolled back, the
                // item stays pending for a future run.
                eprintln!("Warning: persist failed for {}: {}", item.id, e);
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// One gateway call under the concurrency cap, retried per policy for
/// transport errors only.
async fn enrich_with_retry(
    enricher: &dyn Enricher,
    semaphore: &Semaphore,
    retry: &RetryPolicy,
    item: &Item,
    result: &AnalysisResult,
    stage: Stage,
    stats: &mut ChainStats,
) -> Result<EnrichOutcome, EnrichError> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| EnrichError::Transport(e.to_string()))?;

    let request = EnrichRequest {
        item_id: item.id.clone(),
        stage,
        text: format!("{}\n\n{}", item.subject, item.body),
        prior_summary: prior_summary(result),
    };

    let attempt = retry
        .run(|| enricher.enrich(&request), EnrichError::is_retryable)
        .await;
    stats.retries += attempt.retries as u64;
    attempt.result
}

/// Compact description of the running result, sent as context to the
/// enrichment service.
fn prior_summary(result: &AnalysisResult) -> String {
    let entities = serde_json::to_string(&result.entities).unwrap_or_else(|_| "{}".to_string());
    format!(
        "workflow_state={} priority={} confidence={:.2} entities={}",
        result.workflow_state, result.priority, result.confidence, entities
    )
}

fn log_outcome_quality(item_id: &str, stage: Stage, outcome: &EnrichOutcome) {
    for warning in &outcome.warnings {
        eprintln!("Warning: {} response for {} repaired: {}", stage.as_str(), item_id, warning);
    }
    if !outcome.missing.is_empty() {
        eprintln!(
            "Warning: {} response for {} missing required fields {:?}; keeping partial result",
            stage.as_str(),
            item_id,
            outcome.missing
        );
    }
}

/// Report candidate counts and a routing estimate without writing anything.
async fn dry_run(
    config: &Config,
    opts: &AnalyzeOptions,
    pool: &SqlitePool,
    overrides: &RoutingOverrides,
) -> Result<RunOutcome> {
    let limit = opts.limit.unwrap_or(i64::MAX as usize);
    let retry = RetryPolicy::new(config.enrichment.max_retries, Duration::from_secs(1));
    let mut cursor: Option<String> = None;
    let mut offset = opts.offset;
    let mut chains = 0usize;
    let mut items = 0usize;
    let mut phase2_planned = 0u64;
    let mut phase3_planned = 0u64;
    let mut complete_chains = 0usize;

    while chains < limit {
        let page = config.batch.size.min(limit - chains);
        let keys = retry
            .run(
                || store::pending_chain_keys(pool, cursor.as_deref(), page, offset),
                store::is_transient_db_error,
            )
            .await
            .result?;
        offset = 0;
        let Some(last) = keys.last().cloned() else {
            break;
        };

        for key in &keys {
            let chain_items = retry
                .run(
                    || store::load_chain_items(pool, key),
                    store::is_transient_db_error,
                )
                .await
                .result?;
            let Some(chain) = group_into_chains(chain_items).into_iter().next() else {
                continue;
            };
            let analysis = score_chain(&chain, &config.scoring);
            if analysis.is_complete {
                complete_chains += 1;
            }
            for item in chain.items.iter().filter(|i| i.status == ItemStatus::Pending) {
                let result = extract::analyze_item(item);
                let signal = ValueSignal {
                    dollar_value: result.max_dollar_value(),
                    urgency: result.urgency,
                };
                let plan = select_phases(&analysis, &signal, &config.routing, overrides);
                items += 1;
                if plan.run_phase2 {
                    phase2_planned += 1;
                }
                if plan.run_phase3 {
                    phase3_planned += 1;
                }
            }
        }

        chains += keys.len();
        cursor = Some(last);
    }

    println!("analyze (dry-run)");
    println!("  pending chains: {}", chains);
    println!("  pending items: {}", items);
    println!("  complete chains: {}", complete_chains);
    println!("  phase 2 calls planned: {}", phase2_planned);
    println!("  phase 3 calls planned: {}", phase3_planned);

    Ok(RunOutcome::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_resume() {
        let opts = AnalyzeOptions::default();
        assert!(opts.resume);
        assert!(!opts.dry_run);
        assert!(opts.limit.is_none());
    }

    #[test]
    fn zero_ceiling_disables_memory_check() {
        assert_eq!(over_memory_ceiling(0), None);
    }

    #[tokio::test]
    async fn transient_lock_errors_are_retried_to_success() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        let attempt = retry
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(anyhow::anyhow!("database is locked"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                store::is_transient_db_error,
            )
            .await;
        assert_eq!(attempt.result.unwrap(), 1);
        assert_eq!(attempt.retries, 1);
    }
}
