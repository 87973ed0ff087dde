//! Entity store queries: item paging, transactional persistence, and run
//! summaries.
//!
//! All writes belonging to one item's final result (status fields plus the
//! analysis row) commit in a single transaction; a rollback leaves the item
//! `pending` for reprocessing. Analysis rows are upserted keyed on item id,
//! which makes re-persisting after a resume idempotent.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::models::{AnalysisResult, ChainAnalysis, Item, ItemStatus};

/// Number of distinct chains that still have pending items.
pub async fn count_pending_chains(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT chain_key) FROM items WHERE status = 'pending'",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_pending_items(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Fetch one page of chain keys that still have pending items.
///
/// Keyset pagination over `chain_key` keeps paging deterministic and makes
/// forward progress even when a chain's items stay pending after a failed
/// persist — the cursor moves past it for the rest of the run.
pub async fn pending_chain_keys(
    pool: &SqlitePool,
    after_key: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<Vec<String>> {
    let limit = limit.min(i64::MAX as usize) as i64;
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT chain_key FROM items
        WHERE status = 'pending' AND chain_key > ?
        ORDER BY chain_key
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(after_key.unwrap_or(""))
    .bind(limit)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| r.get("chain_key")).collect())
}

/// Load every item of a chain (all statuses — scoring needs the full
/// conversation even when part of it was analyzed in an earlier run).
pub async fn load_chain_items(pool: &SqlitePool, chain_key: &str) -> Result<Vec<Item>> {
    let rows = sqlx::query(
        r#"
        SELECT id, chain_key, subject, body, sender, received_at, has_attachments,
               status, workflow_state, priority, confidence, analyzed_at
        FROM items
        WHERE chain_key = ?
        ORDER BY received_at, id
        "#,
    )
    .bind(chain_key)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(item_from_row).collect())
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Item {
    let status: String = row.get("status");
    Item {
        id: row.get("id"),
        chain_key: row.get("chain_key"),
        subject: row.get("subject"),
        body: row.get("body"),
        sender: row.get("sender"),
        received_at: row.get("received_at"),
        has_attachments: row.get::<i64, _>("has_attachments") != 0,
        status: ItemStatus::parse(&status),
        workflow_state: row.get("workflow_state"),
        priority: row.get("priority"),
        confidence: row.get("confidence"),
        analyzed_at: row.get("analyzed_at"),
    }
}

/// Persist one item's final result atomically: the item's pipeline fields
/// and the analysis row commit together or not at all.
pub async fn persist_item_result(
    pool: &SqlitePool,
    item_id: &str,
    result: &AnalysisResult,
    chain_analysis: &ChainAnalysis,
    phase_json: &PhaseSnapshots,
) -> Result<()> {
    let entities_json = serde_json::to_string(&result.entities)?;
    let action_items_json = serde_json::to_string(&result.action_items)?;
    let result_hash = hash_result(result)?;
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE items
        SET status = 'analyzed', workflow_state = ?, priority = ?, confidence = ?, analyzed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&result.workflow_state)
    .bind(&result.priority)
    .bind(result.confidence)
    .bind(now)
    .bind(item_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO analysis (item_id, phase1_json, phase2_json, phase3_json, entities_json,
                              action_items_json, chain_type, chain_complete, result_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            phase1_json = excluded.phase1_json,
            phase2_json = excluded.phase2_json,
            phase3_json = excluded.phase3_json,
            entities_json = excluded.entities_json,
            action_items_json = excluded.action_items_json,
            chain_type = excluded.chain_type,
            chain_complete = excluded.chain_complete,
            result_hash = excluded.result_hash,
            created_at = excluded.created_at
        "#,
    )
    .bind(item_id)
    .bind(&phase_json.phase1)
    .bind(&phase_json.phase2)
    .bind(&phase_json.phase3)
    .bind(&entities_json)
    .bind(&action_items_json)
    .bind(chain_analysis.chain_type.as_str())
    .bind(chain_analysis.is_complete as i64)
    .bind(&result_hash)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Serialized result as of the end of each phase, stored for audit.
#[derive(Debug, Clone, Default)]
pub struct PhaseSnapshots {
    pub phase1: String,
    pub phase2: Option<String>,
    pub phase3: Option<String>,
}

/// Mark an item failed. Kept outside any transaction on purpose: if even
/// this single write fails the item simply stays `pending`.
pub async fn mark_item_error(pool: &SqlitePool, item_id: &str) -> Result<()> {
    sqlx::query("UPDATE items SET status = 'error' WHERE id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Content fingerprint over the result, used to verify idempotent re-runs.
pub fn hash_result(result: &AnalysisResult) -> Result<String> {
    let serialized = serde_json::to_string(result)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Append the audit row for a completed run.
#[allow(clippy::too_many_arguments)]
pub async fn write_run_summary(
    pool: &SqlitePool,
    operation_id: &str,
    total_items: i64,
    analyzed: i64,
    errors: i64,
    phase2_runs: i64,
    phase3_runs: i64,
    elapsed_secs: f64,
) -> Result<()> {
    let run_date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    sqlx::query(
        r#"
        INSERT INTO run_summary (run_date, operation_id, total_items, analyzed, errors,
                                 phase2_runs, phase3_runs, elapsed_secs)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run_date)
    .bind(operation_id)
    .bind(total_items)
    .bind(analyzed)
    .bind(errors)
    .bind(phase2_runs)
    .bind(phase3_runs)
    .bind(elapsed_secs)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert or refresh an item from ingestion. Pipeline-assigned fields are
/// preserved on conflict; only source-of-truth columns update.
pub async fn upsert_item(pool: &SqlitePool, item: &Item) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO items (id, chain_key, subject, body, sender, received_at, has_attachments, status)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')
        ON CONFLICT(id) DO UPDATE SET
            chain_key = excluded.chain_key,
            subject = excluded.subject,
            body = excluded.body,
            sender = excluded.sender,
            received_at = excluded.received_at,
            has_attachments = excluded.has_attachments
        "#,
    )
    .bind(&item.id)
    .bind(&item.chain_key)
    .bind(&item.subject)
    .bind(&item.body)
    .bind(&item.sender)
    .bind(item.received_at)
    .bind(item.has_attachments as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// True for SQLite lock/contention errors worth retrying.
pub fn is_transient_db_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("database is locked") || msg.contains("database table is locked") || msg.contains("busy")
}
