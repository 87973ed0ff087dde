//! Chain completeness scoring and workflow typing.
//!
//! Scores how "done" a conversation is by scanning its subjects and bodies
//! for three independent indicator classes (start, middle, end), then adds a
//! length bonus. Pure function of the chain snapshot — no I/O, reentrant,
//! and deterministic, so callers can cache per checkpoint cycle.

use crate::config::ScoringConfig;
use crate::models::{Chain, ChainAnalysis, ChainType};

/// Opening-move language: a request, inquiry, or need being stated.
const START_INDICATORS: &[&str] = &[
    "request",
    "inquiry",
    "quote",
    "rfq",
    "need",
    "looking for",
    "interested in",
    "could you",
    "can you provide",
    "pricing",
];

/// Conversation-in-progress markers: replies, forwards, follow-ups.
const MIDDLE_INDICATORS: &[&str] = &[
    "re:",
    "fw:",
    "fwd:",
    "follow up",
    "follow-up",
    "following up",
    "update on",
    "per our",
    "as discussed",
    "attached",
];

/// Resolution language: delivery, completion, thanks.
const END_INDICATORS: &[&str] = &[
    "thank you",
    "thanks",
    "completed",
    "resolved",
    "delivered",
    "shipped",
    "confirm receipt",
    "all set",
    "closed",
    "invoice paid",
];

/// Ordered category keywords for chain typing. First match wins.
const TYPE_KEYWORDS: &[(ChainType, &[&str])] = &[
    (
        ChainType::QuoteRequest,
        &["quote", "quotation", "rfq", "pricing", "estimate"],
    ),
    (
        ChainType::OrderProcessing,
        &["order", "purchase", "po#", "po #", "invoice", "shipment"],
    ),
    (
        ChainType::Support,
        &["issue", "problem", "error", "support", "not working", "broken"],
    ),
    (
        ChainType::Scheduling,
        &["meeting", "schedule", "calendar", "appointment", "reschedule"],
    ),
];

/// Score a chain's structural completeness and classify its workflow type.
///
/// Each present indicator class contributes its configured weight
/// (35/30/35 by default); chains with 3+ and 5+ items earn length bonuses.
/// The result is capped at 100. `is_complete` compares against the
/// configured threshold (default 70).
pub fn score_chain(chain: &Chain, scoring: &ScoringConfig) -> ChainAnalysis {
    let text = combined_text(chain);

    let has_start = contains_any(&text, START_INDICATORS);
    let has_middle = contains_any(&text, MIDDLE_INDICATORS);
    let has_end = contains_any(&text, END_INDICATORS);

    let mut score = 0u32;
    if has_start {
        score += scoring.start_weight;
    }
    if has_middle {
        score += scoring.middle_weight;
    }
    if has_end {
        score += scoring.end_weight;
    }

    let count = chain.email_count();
    if count >= 3 {
        score += scoring.length_bonus_3;
    }
    if count >= 5 {
        score += scoring.length_bonus_5;
    }

    let score = score.min(100);

    let mut missing_elements = Vec::new();
    if !has_start {
        missing_elements.push("no opening request or inquiry".to_string());
    }
    if !has_middle {
        missing_elements.push("no replies or follow-up activity".to_string());
    }
    if !has_end {
        missing_elements.push("no resolution or completion signal".to_string());
    }

    ChainAnalysis {
        completeness_score: score,
        is_complete: score >= scoring.complete_threshold,
        chain_type: classify(&text),
        missing_elements,
        has_start,
        has_middle,
        has_end,
    }
}

/// Pick the chain type by first keyword match in the fixed category order.
pub fn classify(text: &str) -> ChainType {
    for (chain_type, keywords) in TYPE_KEYWORDS {
        if contains_any(text, keywords) {
            return *chain_type;
        }
    }
    ChainType::Unknown
}

fn combined_text(chain: &Chain) -> String {
    let mut text = String::new();
    for item in &chain.items {
        text.push_str(&item.subject.to_lowercase());
        text.push('\n');
        text.push_str(&item.body.to_lowercase());
        text.push('\n');
    }
    text
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
