//! Core data models used throughout Mailflow.
//!
//! These types represent the emails, chains, and analysis results that flow
//! through the scoring, routing, enrichment, and persistence pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One email message as stored in SQLite.
///
/// Immutable once ingested except for the pipeline-assigned fields
/// (`status`, `workflow_state`, `priority`, `confidence`, `analyzed_at`).
#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub chain_key: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    /// Unix timestamp (seconds).
    pub received_at: i64,
    pub has_attachments: bool,
    pub status: ItemStatus,
    pub workflow_state: Option<String>,
    pub priority: Option<String>,
    pub confidence: Option<f64>,
    pub analyzed_at: Option<i64>,
}

/// Pipeline status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Analyzed,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Analyzed => "analyzed",
            ItemStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> ItemStatus {
        match s {
            "analyzed" => ItemStatus::Analyzed,
            "error" => ItemStatus::Error,
            _ => ItemStatus::Pending,
        }
    }
}

/// A conversation: all items sharing a chain key, ordered by timestamp.
///
/// Chains are derived on demand from the items table, never stored directly.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_key: String,
    /// Items in ascending `received_at` order.
    pub items: Vec<Item>,
}

impl Chain {
    pub fn email_count(&self) -> usize {
        self.items.len()
    }

    pub fn start_time(&self) -> Option<i64> {
        self.items.first().map(|i| i.received_at)
    }

    pub fn end_time(&self) -> Option<i64> {
        self.items.last().map(|i| i.received_at)
    }

    pub fn duration_hours(&self) -> f64 {
        match (self.start_time(), self.end_time()) {
            (Some(start), Some(end)) if end > start => (end - start) as f64 / 3600.0,
            _ => 0.0,
        }
    }
}

/// Workflow classification of a chain, chosen by first keyword match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    QuoteRequest,
    OrderProcessing,
    Support,
    Scheduling,
    Unknown,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::QuoteRequest => "quote_request",
            ChainType::OrderProcessing => "order_processing",
            ChainType::Support => "support",
            ChainType::Scheduling => "scheduling",
            ChainType::Unknown => "unknown",
        }
    }
}

/// Output of the completeness analyzer for one chain.
///
/// Recomputed each run from the chain snapshot; deterministic for a fixed
/// set of items.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainAnalysis {
    /// 0–100, continuous (indicator weights plus length bonus).
    pub completeness_score: u32,
    pub is_complete: bool,
    pub chain_type: ChainType,
    /// Human-readable gap for each absent indicator class, in fixed order.
    pub missing_elements: Vec<String>,
    pub has_start: bool,
    pub has_middle: bool,
    pub has_end: bool,
}

/// Typed entity category extracted from email text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PoNumbers,
    QuoteNumbers,
    Customers,
    DollarValues,
    Dates,
}

/// Urgency signal derived from item text, consumed by the phase router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
    Critical,
}

/// A single extracted follow-up task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub task: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Per-item analysis output, built up incrementally across phases.
///
/// Phase 1 populates the baseline; later phases only add to or override
/// fields. When a later phase fails, the result stays at the last
/// successful phase's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub entities: BTreeMap<EntityKind, Vec<String>>,
    pub workflow_state: String,
    pub priority: String,
    pub urgency: Urgency,
    /// 0.0–1.0; later phases may only raise it.
    pub confidence: f64,
    pub action_items: Vec<ActionItem>,
    /// 1, 2, or 3 — the highest phase whose output is reflected here.
    pub phases_run: u8,
    #[serde(default)]
    pub summary: Option<String>,
}

impl AnalysisResult {
    /// Total number of entity values across all kinds.
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(|v| v.len()).sum()
    }

    /// Largest dollar amount among extracted `dollar_values`, if any.
    ///
    /// Values are stored as extracted (e.g. `"$12,500.00"`); commas and the
    /// currency sign are stripped for comparison.
    pub fn max_dollar_value(&self) -> f64 {
        self.entities
            .get(&EntityKind::DollarValues)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| {
                        v.trim_start_matches('$')
                            .replace(',', "")
                            .trim()
                            .parse::<f64>()
                            .ok()
                    })
                    .fold(0.0, f64::max)
            })
            .unwrap_or(0.0)
    }
}

/// Business-value signal feeding the phase-3 routing decision.
#[derive(Debug, Clone, Copy)]
pub struct ValueSignal {
    pub dollar_value: f64,
    pub urgency: Urgency,
}

/// Which analysis phases will run for an item: `{1}`, `{1,2}`, or `{1,2,3}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub run_phase2: bool,
    pub run_phase3: bool,
}

impl PhasePlan {
    pub fn phase_count(&self) -> u8 {
        1 + self.run_phase2 as u8 + self.run_phase3 as u8
    }
}

/// Durable progress marker for a batch run.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub operation_id: String,
    pub stage_name: String,
    pub state: CheckpointState,
    pub progress_pct: f64,
    pub completed: i64,
    pub total: i64,
    pub errors: i64,
    pub updated_at: i64,
}

/// Serialized partial state stored in the checkpoint row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Keyset cursor: the last chain key whose batch was fully committed.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Chains fully committed so far in this operation.
    pub chains_done: i64,
    pub phase2_runs: i64,
    pub phase3_runs: i64,
    pub retries: i64,
}

/// Aggregate counters for one run. Write-only telemetry; every counter is
/// monotonic within a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessingStats {
    pub chains_seen: u64,
    pub items_completed: u64,
    pub items_errored: u64,
    pub phase2_runs: u64,
    pub phase3_runs: u64,
    pub retries: u64,
    pub fallbacks: u64,
}
