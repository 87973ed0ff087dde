use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Connections in the SQLite pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Completeness scoring knobs.
///
/// The weights and thresholds are empirically chosen defaults, not hard
/// invariants; validate against real data before tightening them.
#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_complete_threshold")]
    pub complete_threshold: u32,
    #[serde(default = "default_start_weight")]
    pub start_weight: u32,
    #[serde(default = "default_middle_weight")]
    pub middle_weight: u32,
    #[serde(default = "default_end_weight")]
    pub end_weight: u32,
    /// Bonus added once the chain has at least 3 items.
    #[serde(default = "default_length_bonus")]
    pub length_bonus_3: u32,
    /// Additional bonus at 5 or more items.
    #[serde(default = "default_length_bonus")]
    pub length_bonus_5: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            complete_threshold: default_complete_threshold(),
            start_weight: default_start_weight(),
            middle_weight: default_middle_weight(),
            end_weight: default_end_weight(),
            length_bonus_3: default_length_bonus(),
            length_bonus_5: default_length_bonus(),
        }
    }
}

fn default_complete_threshold() -> u32 {
    70
}
fn default_start_weight() -> u32 {
    35
}
fn default_middle_weight() -> u32 {
    30
}
fn default_end_weight() -> u32 {
    35
}
fn default_length_bonus() -> u32 {
    10
}

/// Phase routing thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Dollar value above which a complete chain qualifies for phase 3.
    #[serde(default = "default_phase3_dollar_threshold")]
    pub phase3_dollar_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            phase3_dollar_threshold: default_phase3_dollar_threshold(),
        }
    }
}

fn default_phase3_dollar_threshold() -> f64 {
    50_000.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum concurrent enrichment calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
        }
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_concurrency() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    /// Chains per batch pulled from the store.
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Items between checkpoint writes.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Stable identifier used to find this run's checkpoint on resume.
    #[serde(default = "default_operation_id")]
    pub operation_id: String,
    /// Resident-memory ceiling in MB; the run checkpoints and stops when
    /// exceeded. 0 disables the check.
    #[serde(default)]
    pub memory_ceiling_mb: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            operation_id: default_operation_id(),
            memory_ceiling_mb: 0,
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_checkpoint_interval() -> u64 {
    25
}
fn default_operation_id() -> String {
    "email-analysis".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate db
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    // Validate scoring
    let s = &config.scoring;
    if s.complete_threshold > 100 {
        anyhow::bail!("scoring.complete_threshold must be <= 100");
    }
    if s.start_weight + s.middle_weight + s.end_weight == 0 {
        anyhow::bail!("scoring weights must not all be zero");
    }

    // Validate routing
    if config.routing.phase3_dollar_threshold < 0.0 {
        anyhow::bail!("routing.phase3_dollar_threshold must be >= 0");
    }

    // Validate batch
    if config.batch.size == 0 {
        anyhow::bail!("batch.size must be > 0");
    }
    if config.batch.checkpoint_interval == 0 {
        anyhow::bail!("batch.checkpoint_interval must be > 0");
    }
    if config.batch.operation_id.is_empty() {
        anyhow::bail!("batch.operation_id must not be empty");
    }

    // Validate enrichment
    if config.enrichment.is_enabled() {
        if config.enrichment.model.is_none() {
            anyhow::bail!(
                "enrichment.model must be specified when provider is '{}'",
                config.enrichment.provider
            );
        }
        if config.enrichment.concurrency == 0 {
            anyhow::bail!("enrichment.concurrency must be > 0");
        }
    }

    match config.enrichment.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown enrichment provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(config)
}
