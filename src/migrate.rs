use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent — safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Items table: one row per email message
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            chain_key TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            sender TEXT NOT NULL DEFAULT '',
            received_at INTEGER NOT NULL,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            workflow_state TEXT,
            priority TEXT,
            confidence REAL,
            analyzed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Analysis table: one row per analyzed item, upserted idempotently
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis (
            item_id TEXT PRIMARY KEY,
            phase1_json TEXT NOT NULL,
            phase2_json TEXT,
            phase3_json TEXT,
            entities_json TEXT NOT NULL DEFAULT '{}',
            action_items_json TEXT NOT NULL DEFAULT '[]',
            chain_type TEXT NOT NULL DEFAULT 'unknown',
            chain_complete INTEGER NOT NULL DEFAULT 0,
            result_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Checkpoints: one active row per (operation_id, stage_name)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            operation_id TEXT NOT NULL,
            stage_name TEXT NOT NULL,
            state_json TEXT NOT NULL DEFAULT '{}',
            progress_pct REAL NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (operation_id, stage_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run summaries: append-only audit row per completed run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_summary (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_date TEXT NOT NULL,
            operation_id TEXT NOT NULL,
            total_items INTEGER NOT NULL,
            analyzed INTEGER NOT NULL,
            errors INTEGER NOT NULL,
            phase2_runs INTEGER NOT NULL,
            phase3_runs INTEGER NOT NULL,
            elapsed_secs REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_chain_key ON items(chain_key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_status ON items(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_received_at ON items(received_at)")
        .execute(pool)
        .await?;

    Ok(())
}
