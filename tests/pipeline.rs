//! End-to-end pipeline tests against a temporary SQLite database, with the
//! enrichment gateway replaced by in-process fakes.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;
use tokio::sync::watch;

use mailflow::checkpoint;
use mailflow::config::{BatchConfig, Config, DbConfig, EnrichmentConfig, RoutingConfig, ScoringConfig};
use mailflow::enrich::{outcome_from_text, EnrichError, EnrichOutcome, EnrichRequest, Enricher, Stage};
use mailflow::migrate;
use mailflow::models::{Item, ItemStatus};
use mailflow::pipeline::{self, AnalyzeOptions};
use mailflow::progress::NoProgress;
use mailflow::store;
use mailflow::{db, pipeline::STAGE_NAME};

/// Enricher returning a clean, stage-appropriate JSON response every time.
struct ScriptedEnricher;

#[async_trait]
impl Enricher for ScriptedEnricher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichOutcome, EnrichError> {
        let raw = match request.stage {
            Stage::Two => {
                r#"{"workflow_validation": "confirmed", "missed_entities": {"customers": ["Globex"]}, "confidence": 0.92}"#
            }
            Stage::Three => {
                r#"{"strategic_priority": "High", "next_steps": ["confirm delivery schedule"], "completion_indicators": ["order delivered"]}"#
            }
        };
        outcome_from_text(request.stage, raw)
    }
}

/// Enricher whose transport always fails, for fallback behavior.
struct FailingEnricher;

#[async_trait]
impl Enricher for FailingEnricher {
    fn name(&self) -> &str {
        "failing"
    }

    async fn enrich(&self, _request: &EnrichRequest) -> Result<EnrichOutcome, EnrichError> {
        Err(EnrichError::Transport("connection refused".to_string()))
    }
}

fn test_config(dir: &TempDir, provider: &str) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("mailflow.sqlite"),
            max_connections: 5,
        },
        scoring: ScoringConfig::default(),
        routing: RoutingConfig::default(),
        enrichment: EnrichmentConfig {
            provider: provider.to_string(),
            model: (provider != "disabled").then(|| "test-model".to_string()),
            // Single attempt keeps failing-gateway tests fast.
            max_retries: 1,
            ..EnrichmentConfig::default()
        },
        batch: BatchConfig::default(),
    }
}

async fn setup(config: &Config) -> SqlitePool {
    let pool = db::connect(config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    pool
}

fn email(id: &str, chain_key: &str, subject: &str, body: &str, ts: i64) -> Item {
    Item {
        id: id.to_string(),
        chain_key: chain_key.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        sender: "Jane Doe <jane@acme.com>".to_string(),
        received_at: ts,
        has_attachments: false,
        status: ItemStatus::Pending,
        workflow_state: None,
        priority: None,
        confidence: None,
        analyzed_at: None,
    }
}

/// A complete quote chain: start, replies, resolution. The first email
/// carries a dollar value above the phase-3 threshold.
async fn seed_complete_chain(pool: &SqlitePool, chain_key: &str) {
    let items = vec![
        email(
            &format!("{}-1", chain_key),
            chain_key,
            "Quote request for CNC machines",
            "Hi team, we need pricing for two units, budget around $60,000.",
            100,
        ),
        email(
            &format!("{}-2", chain_key),
            chain_key,
            "RE: Quote request for CNC machines",
            "Quote attached, as discussed.",
            200,
        ),
        email(
            &format!("{}-3", chain_key),
            chain_key,
            "RE: Quote request for CNC machines",
            "Thank you, order delivered.",
            300,
        ),
    ];
    for item in &items {
        store::upsert_item(pool, item).await.unwrap();
    }
}

async fn run(
    config: &Config,
    opts: &AnalyzeOptions,
    pool: &SqlitePool,
    enricher: Arc<dyn Enricher>,
) -> pipeline::RunOutcome {
    let (_tx, rx) = watch::channel(false);
    pipeline::run_analyze(config, opts, pool, enricher, &NoProgress, rx)
        .await
        .unwrap()
}

async fn analyzed_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'analyzed'")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn extract_only_run_analyzes_everything_without_gateway_calls() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "disabled");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    let outcome = run(
        &config,
        &AnalyzeOptions::default(),
        &pool,
        Arc::new(FailingEnricher), // must never be called
    )
    .await;

    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.errors, 0);
    assert_eq!(outcome.phase2_runs, 0);
    assert_eq!(outcome.phase3_runs, 0);
    assert_eq!(outcome.fallbacks, 0);
    assert!(!outcome.interrupted);
    assert_eq!(analyzed_count(&pool).await, 3);

    // Completed runs leave no checkpoint behind.
    assert!(checkpoint::load_checkpoint(&pool, &config.batch.operation_id, STAGE_NAME)
        .await
        .unwrap()
        .is_none());

    let summaries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_summary")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(summaries, 1);
}

#[tokio::test]
async fn complete_high_value_chain_gets_phase_three() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "openai");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    let outcome = run(&config, &AnalyzeOptions::default(), &pool, Arc::new(ScriptedEnricher)).await;

    assert_eq!(outcome.completed, 3);
    // Every item gets phase 2; only the $60,000 email qualifies for phase 3.
    assert_eq!(outcome.phase2_runs, 3);
    assert_eq!(outcome.phase3_runs, 1);

    // Enrichment output merged additively and persisted.
    let row = sqlx::query("SELECT entities_json, phase3_json FROM analysis WHERE item_id = ?")
        .bind("chain-a-1")
        .fetch_one(&pool)
        .await
        .unwrap();
    let entities: String = row.get("entities_json");
    assert!(entities.contains("Globex"), "missed entity not merged: {}", entities);
    assert!(entities.contains("Jane Doe"), "phase-1 entity lost: {}", entities);
    assert!(row.get::<Option<String>, _>("phase3_json").is_some());

    let confidence: f64 = sqlx::query_scalar("SELECT confidence FROM items WHERE id = ?")
        .bind("chain-a-1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(confidence, 0.92);
}

#[tokio::test]
async fn gateway_failure_falls_back_to_extraction_result() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "openai");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    let outcome = run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;

    // Every item still completes with its phase-1 result.
    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.errors, 0);
    assert_eq!(outcome.phase2_runs, 0);
    assert_eq!(outcome.fallbacks, 3);
    assert_eq!(analyzed_count(&pool).await, 3);

    let row = sqlx::query("SELECT phase1_json, phase2_json FROM analysis WHERE item_id = ?")
        .bind("chain-a-2")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!row.get::<String, _>("phase1_json").is_empty());
    assert!(row.get::<Option<String>, _>("phase2_json").is_none());
}

#[tokio::test]
async fn rerun_produces_identical_analysis_rows() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "disabled");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;
    seed_complete_chain(&pool, "chain-b").await;

    run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;

    let first: Vec<(String, String)> =
        sqlx::query_as("SELECT item_id, result_hash FROM analysis ORDER BY item_id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(first.len(), 6);

    // Reprocess from scratch: upserts must land on the same rows with the
    // same content.
    sqlx::query("UPDATE items SET status = 'pending'")
        .execute(&pool)
        .await
        .unwrap();
    run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;

    let second: Vec<(String, String)> =
        sqlx::query_as("SELECT item_id, result_hash FROM analysis ORDER BY item_id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn interrupted_run_checkpoints_and_resumes_to_completion() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "disabled");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;
    seed_complete_chain(&pool, "chain-b").await;

    // Cancellation already requested: the run stops before the first batch
    // and leaves a resumable checkpoint.
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let outcome = pipeline::run_analyze(
        &config,
        &AnalyzeOptions::default(),
        &pool,
        Arc::new(FailingEnricher),
        &NoProgress,
        rx,
    )
    .await
    .unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.completed, 0);
    assert!(checkpoint::load_checkpoint(&pool, &config.batch.operation_id, STAGE_NAME)
        .await
        .unwrap()
        .is_some());

    // Resume and finish.
    let outcome = run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;
    assert!(!outcome.interrupted);
    assert_eq!(outcome.completed, 6);
    assert_eq!(analyzed_count(&pool).await, 6);
    assert!(checkpoint::load_checkpoint(&pool, &config.batch.operation_id, STAGE_NAME)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn memory_ceiling_stops_the_run_with_a_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "disabled");
    // Any running process exceeds a 1 MB resident set.
    config.batch.memory_ceiling_mb = 1;
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    let outcome = run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;

    assert!(outcome.interrupted);
    assert_eq!(outcome.completed, 0);
    assert_eq!(store::count_pending_items(&pool).await.unwrap(), 3);
    assert!(checkpoint::load_checkpoint(&pool, &config.batch.operation_id, STAGE_NAME)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn persist_failure_rolls_back_and_items_stay_pending() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "disabled");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    // Break the analysis table so every per-item transaction rolls back.
    sqlx::query("DROP TABLE analysis").execute(&pool).await.unwrap();

    let outcome = run(&config, &AnalyzeOptions::default(), &pool, Arc::new(FailingEnricher)).await;

    // The run itself survives; the failures are counted, not fatal.
    assert!(!outcome.interrupted);
    assert_eq!(outcome.completed, 0);
    assert_eq!(outcome.errors, 3);

    // Rollback semantics: items are still pending, and nothing was marked
    // errored — that status is reserved for exhausted lock contention.
    assert_eq!(store::count_pending_items(&pool).await.unwrap(), 3);
    let errored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'error'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(errored, 0);
    assert_eq!(analyzed_count(&pool).await, 0);
}

#[tokio::test]
async fn limit_bounds_the_number_of_chains_processed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "disabled");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;
    seed_complete_chain(&pool, "chain-b").await;
    seed_complete_chain(&pool, "chain-c").await;

    let opts = AnalyzeOptions {
        limit: Some(1),
        batch_size: Some(1),
        ..AnalyzeOptions::default()
    };
    let outcome = run(&config, &opts, &pool, Arc::new(FailingEnricher)).await;
    assert_eq!(outcome.completed, 3); // one chain of three items

    let pending = store::count_pending_items(&pool).await.unwrap();
    assert_eq!(pending, 6);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "openai");
    let pool = setup(&config).await;
    seed_complete_chain(&pool, "chain-a").await;

    let opts = AnalyzeOptions {
        dry_run: true,
        ..AnalyzeOptions::default()
    };
    run(&config, &opts, &pool, Arc::new(ScriptedEnricher)).await;

    assert_eq!(analyzed_count(&pool).await, 0);
    let analysis_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(analysis_rows, 0);
}
