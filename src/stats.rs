//! Database statistics and health overview.
//!
//! Provides a quick summary of the corpus and analysis coverage: item counts
//! by status, chain counts, per-chain-type breakdowns, and open checkpoints.
//! Used by `mfl stats` to verify ingestion and analysis runs are progressing.

use anyhow::Result;
use sqlx::Row;

use crate::checkpoint;
use crate::config::Config;
use crate::db;

/// Per-chain-type breakdown of analyzed items.
struct TypeStats {
    chain_type: String,
    item_count: i64,
    complete_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(&pool)
        .await?;

    let total_chains: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT chain_key) FROM items")
        .fetch_one(&pool)
        .await?;

    let analyzed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'analyzed'")
        .fetch_one(&pool)
        .await?;

    let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'pending'")
        .fetch_one(&pool)
        .await?;

    let errors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'error'")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Mailflow — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Items:       {}", total_items);
    println!("  Chains:      {}", total_chains);
    println!(
        "  Analyzed:    {} / {} ({}%)",
        analyzed,
        total_items,
        if total_items > 0 {
            (analyzed * 100) / total_items
        } else {
            0
        }
    );
    println!("  Pending:     {}", pending);
    println!("  Errors:      {}", errors);

    // Per-chain-type breakdown from the analysis table
    let type_rows = sqlx::query(
        r#"
        SELECT
            chain_type,
            COUNT(*) AS item_count,
            SUM(chain_complete) AS complete_count
        FROM analysis
        GROUP BY chain_type
        ORDER BY item_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let type_stats: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            chain_type: row.get("chain_type"),
            item_count: row.get("item_count"),
            complete_count: row.get::<Option<i64>, _>("complete_count").unwrap_or(0),
        })
        .collect();

    if !type_stats.is_empty() {
        println!();
        println!("  By chain type:");
        println!(
            "  {:<20} {:>8} {:>10}",
            "TYPE", "ITEMS", "COMPLETE"
        );
        println!("  {}", "-".repeat(42));

        for t in &type_stats {
            println!(
                "  {:<20} {:>8} {:>10}",
                t.chain_type, t.item_count, t.complete_count
            );
        }
    }

    // Open checkpoints mean an interrupted run is resumable
    let checkpoints = checkpoint::list_checkpoints(&pool).await?;
    if !checkpoints.is_empty() {
        println!();
        println!("  Open checkpoints:");
        for cp in &checkpoints {
            println!(
                "  {} / {}  {} / {} items ({} errors), updated {}",
                cp.operation_id,
                cp.stage_name,
                cp.completed,
                cp.total,
                cp.errors,
                format_ts_relative(cp.updated_at)
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
