//! Durable checkpoints for resumable batch runs.
//!
//! One active row per (operation_id, stage_name), upserted at a fixed
//! cadence and deleted when a run completes. A checkpoint is only ever
//! written after the work it claims has been committed, so its counters
//! never run ahead of the database.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{Checkpoint, CheckpointState};

pub async fn load_checkpoint(
    pool: &SqlitePool,
    operation_id: &str,
    stage_name: &str,
) -> Result<Option<Checkpoint>> {
    let row = sqlx::query(
        r#"
        SELECT state_json, progress_pct, completed, total, errors, updated_at
        FROM checkpoints
        WHERE operation_id = ? AND stage_name = ?
        "#,
    )
    .bind(operation_id)
    .bind(stage_name)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let state_json: String = row.get("state_json");
    // A checkpoint we cannot deserialize is run-fatal, not silently fresh:
    // resuming from zero would double-process committed work's accounting.
    let state: CheckpointState = serde_json::from_str(&state_json)
        .with_context(|| format!("corrupt checkpoint state for operation '{}'", operation_id))?;

    Ok(Some(Checkpoint {
        operation_id: operation_id.to_string(),
        stage_name: stage_name.to_string(),
        state,
        progress_pct: row.get("progress_pct"),
        completed: row.get("completed"),
        total: row.get("total"),
        errors: row.get("errors"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn save_checkpoint(pool: &SqlitePool, checkpoint: &Checkpoint) -> Result<()> {
    let state_json = serde_json::to_string(&checkpoint.state)?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO checkpoints (operation_id, stage_name, state_json, progress_pct, completed, total, errors, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(operation_id, stage_name) DO UPDATE SET
            state_json = excluded.state_json,
            progress_pct = excluded.progress_pct,
            completed = excluded.completed,
            total = excluded.total,
            errors = excluded.errors,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&checkpoint.operation_id)
    .bind(&checkpoint.stage_name)
    .bind(&state_json)
    .bind(checkpoint.progress_pct)
    .bind(checkpoint.completed)
    .bind(checkpoint.total)
    .bind(checkpoint.errors)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn clear_checkpoint(
    pool: &SqlitePool,
    operation_id: &str,
    stage_name: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM checkpoints WHERE operation_id = ? AND stage_name = ?")
        .bind(operation_id)
        .bind(stage_name)
        .execute(pool)
        .await?;
    Ok(())
}

/// All checkpoint rows, for `mfl checkpoint list`.
pub async fn list_checkpoints(pool: &SqlitePool) -> Result<Vec<Checkpoint>> {
    let rows = sqlx::query(
        r#"
        SELECT operation_id, stage_name, state_json, progress_pct, completed, total, errors, updated_at
        FROM checkpoints
        ORDER BY updated_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut checkpoints = Vec::with_capacity(rows.len());
    for row in &rows {
        let state_json: String = row.get("state_json");
        let state: CheckpointState = serde_json::from_str(&state_json).unwrap_or_default();
        checkpoints.push(Checkpoint {
            operation_id: row.get("operation_id"),
            stage_name: row.get("stage_name"),
            state,
            progress_pct: row.get("progress_pct"),
            completed: row.get("completed"),
            total: row.get("total"),
            errors: row.get("errors"),
            updated_at: row.get("updated_at"),
        });
    }

    Ok(checkpoints)
}
