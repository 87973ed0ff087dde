//! Enrichment gateway: the boundary to the external inference service.
//!
//! Phases 2 and 3 are opaque "enrichment" calls with an input/output
//! contract; the service's output format is untrusted and goes through the
//! tolerant parse chain in [`crate::parse`]. The gateway performs a single
//! attempt per call — retry discipline lives in [`crate::retry`], injected
//! by the orchestrator, so call sites never grow ad hoc retry loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::EnrichmentConfig;
use crate::parse::{parse_response, ParseOutcome};

/// Which enrichment stage is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Validation and entity backfill.
    Two,
    /// Strategic analysis, reserved for complete high-value chains.
    Three,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Two => "phase2",
            Stage::Three => "phase3",
        }
    }

    /// Fields the contract requires the service to return for this stage.
    /// Absences are content failures: logged, partial result kept.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Stage::Two => &["workflow_validation", "missed_entities", "confidence"],
            Stage::Three => &["strategic_priority", "next_steps", "completion_indicators"],
        }
    }
}

/// One enrichment request: the item text plus a summary of what earlier
/// phases already found.
#[derive(Debug, Clone)]
pub struct EnrichRequest {
    pub item_id: String,
    pub stage: Stage,
    pub text: String,
    pub prior_summary: String,
}

/// A usable (possibly partial) enrichment response.
#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub fields: Map<String, Value>,
    /// Repairs the tolerant parser had to apply, for logging.
    pub warnings: Vec<String>,
    /// Required fields the response failed to include.
    pub missing: Vec<&'static str>,
}

/// Gateway failure taxonomy. Only transport failures are retryable; parse
/// failures fall back to the prior phase, rejections are configuration
/// problems.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment provider is disabled")]
    Disabled,

    /// Connection error, timeout, rate limit, or server-side failure.
    #[error("enrichment transport error: {0}")]
    Transport(String),

    /// The service refused the request (auth, bad model, malformed call).
    #[error("enrichment request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The response body was structurally unrecoverable.
    #[error("enrichment response unusable: {reason}")]
    Parse { reason: String, raw: String },
}

impl EnrichError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnrichError::Transport(_))
    }
}

/// An enrichment backend. Implemented by the HTTP providers and by test
/// fakes — the orchestrator only ever sees this trait.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichOutcome, EnrichError>;
}

/// Create the enricher configured in `[enrichment]`.
pub fn create_enricher(config: &EnrichmentConfig) -> Result<Arc<dyn Enricher>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEnricher)),
        "openai" | "ollama" => Ok(Arc::new(HttpEnricher::new(config)?)),
        other => bail!("Unknown enrichment provider: {}", other),
    }
}

/// No-op enricher used when `[enrichment] provider = "disabled"`. The
/// orchestrator routes around it (extraction-only), so any call reaching
/// this is a bug surfaced as a typed error rather than a panic.
pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn enrich(&self, _request: &EnrichRequest) -> Result<EnrichOutcome, EnrichError> {
        Err(EnrichError::Disabled)
    }
}

/// Enricher backed by a chat-completions-style HTTP endpoint (OpenAI API
/// or a local Ollama instance).
pub struct HttpEnricher {
    client: reqwest::Client,
    provider: String,
    model: String,
    url: String,
    api_key: Option<String>,
}

impl HttpEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.model required for '{}'", config.provider))?;

        let (url, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
                (url, Some(key))
            }
            "ollama" => {
                let base = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                (format!("{}/api/chat", base), None)
            }
            other => bail!("HttpEnricher does not support provider '{}'", other),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            provider: config.provider.clone(),
            model,
            url,
            api_key,
        })
    }

    fn request_body(&self, request: &EnrichRequest) -> Value {
        let required = request.stage.required_fields().join(", ");
        let system = format!(
            "You analyze business email for workflow intelligence. \
             Respond with a single JSON object containing at least: {}.",
            required
        );
        let user = format!(
            "Stage: {}\nPrior analysis:\n{}\n\nEmail:\n{}",
            request.stage.as_str(),
            request.prior_summary,
            request.text
        );

        match self.provider.as_str() {
            "ollama" => serde_json::json!({
                "model": self.model,
                "stream": false,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }),
            _ => serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }),
        }
    }

    /// Pull the assistant message text out of the provider's envelope.
    fn message_content(&self, body: &Value) -> Option<String> {
        let content = match self.provider.as_str() {
            "ollama" => body.pointer("/message/content"),
            _ => body.pointer("/choices/0/message/content"),
        };
        content.and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichOutcome, EnrichError> {
        let mut call = self.client.post(&self.url).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", format!("Bearer {}", key));
        }

        let response = call
            .send()
            .await
            .map_err(|e| EnrichError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Rate limits and server errors are transient; other client
            // errors are not worth retrying.
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(EnrichError::Transport(format!(
                    "{} returned {}: {}",
                    self.provider, status, body
                )));
            }
            return Err(EnrichError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Transport(format!("reading response body: {}", e)))?;

        let content = self.message_content(&envelope).ok_or_else(|| EnrichError::Parse {
            reason: "response envelope carried no message content".to_string(),
            raw: envelope.to_string(),
        })?;

        outcome_from_text(request.stage, &content)
    }
}

/// Run the tolerant parse chain over raw model output and check the stage
/// contract. Shared by the HTTP provider and exercised directly by tests.
pub fn outcome_from_text(stage: Stage, raw: &str) -> Result<EnrichOutcome, EnrichError> {
    let (fields, warnings) = match parse_response(raw) {
        ParseOutcome::Parsed(fields) => (fields, Vec::new()),
        ParseOutcome::Repaired { fields, warnings } => (fields, warnings),
        ParseOutcome::Unparseable { raw } => {
            return Err(EnrichError::Parse {
                reason: "no structured data recoverable".to_string(),
                raw,
            })
        }
    };

    let missing: Vec<&'static str> = stage
        .required_fields()
        .iter()
        .filter(|f| !fields.contains_key(**f))
        .copied()
        .collect();

    Ok(EnrichOutcome {
        fields,
        warnings,
        missing,
    })
}
