//! JSONL email ingestion.
//!
//! Seeds the items table from a JSON-Lines export, one email object per
//! line. Records are upserted by id, so re-ingesting the same file is
//! idempotent and never disturbs pipeline-assigned fields on already
//! analyzed items. Malformed lines are skipped with a warning rather than
//! aborting the whole import.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::{Item, ItemStatus};
use crate::store;

/// One email record as it appears in the export file.
///
/// `id` is optional: when absent, a deterministic UUID is derived from the
/// chain key, sender, and timestamp so repeat imports map to the same row.
#[derive(Debug, Deserialize)]
struct IngestRecord {
    #[serde(default)]
    id: Option<String>,
    chain_key: String,
    subject: String,
    #[serde(default)]
    body: String,
    sender: String,
    /// Unix timestamp (seconds).
    received_at: i64,
    #[serde(default)]
    has_attachments: bool,
}

pub async fn run_ingest(config: &Config, file: &Path, limit: Option<usize>) -> Result<()> {
    let pool = db::connect(config).await?;

    let reader = std::io::BufReader::new(
        std::fs::File::open(file)
            .with_context(|| format!("Failed to open input file: {}", file.display()))?,
    );

    let mut ingested = 0u64;
    let mut skipped = 0u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", file.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        if let Some(lim) = limit {
            if ingested as usize >= lim {
                break;
            }
        }

        let record: IngestRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!(
                    "Warning: skipping line {} of {}: {}",
                    line_no + 1,
                    file.display(),
                    e
                );
                skipped += 1;
                continue;
            }
        };

        if record.chain_key.trim().is_empty() {
            eprintln!(
                "Warning: skipping line {} of {}: empty chain_key",
                line_no + 1,
                file.display()
            );
            skipped += 1;
            continue;
        }

        let item = item_from_record(record);
        store::upsert_item(&pool, &item).await?;
        ingested += 1;
    }

    println!("Ingest complete:");
    println!("  items upserted:  {}", ingested);
    if skipped > 0 {
        println!("  lines skipped:   {}", skipped);
    }

    let pending = store::count_pending_items(&pool).await?;
    println!("  pending items:   {}", pending);

    pool.close().await;
    Ok(())
}

fn item_from_record(record: IngestRecord) -> Item {
    let id = match record.id {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            let seed = format!(
                "{}|{}|{}",
                record.chain_key, record.sender, record.received_at
            );
            Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
        }
    };

    Item {
        id,
        chain_key: record.chain_key,
        subject: record.subject,
        body: record.body,
        sender: record.sender,
        received_at: record.received_at,
        has_attachments: record.has_attachments,
        status: ItemStatus::Pending,
        workflow_state: None,
        priority: None,
        confidence: None,
        analyzed_at: None,
    }
}
