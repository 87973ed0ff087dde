//! Entity aggregation across analysis phases.
//!
//! Later phases may only add to or override what earlier phases found:
//! entity lists grow additively (deduplicated by kind and normalized
//! value), confidence only rises, and duplicate action items collapse.
//! Nothing a prior phase extracted is ever dropped here.

use serde_json::Value;

use crate::enrich::{EnrichOutcome, Stage};
use crate::extract::{normalize, push_entity};
use crate::models::{ActionItem, AnalysisResult, EntityKind};

/// Fold a stage-2 or stage-3 enrichment outcome into the running result.
pub fn merge_enrichment(result: &mut AnalysisResult, outcome: &EnrichOutcome, stage: Stage) {
    match stage {
        Stage::Two => merge_stage2(result, outcome),
        Stage::Three => merge_stage3(result, outcome),
    }
    result.phases_run = result.phases_run.max(match stage {
        Stage::Two => 2,
        Stage::Three => 3,
    });
}

fn merge_stage2(result: &mut AnalysisResult, outcome: &EnrichOutcome) {
    if let Some(Value::Object(missed)) = outcome.fields.get("missed_entities") {
        for (key, values) in missed {
            let Some(kind) = entity_kind_from_key(key) else {
                continue;
            };
            for value in string_values(values) {
                push_entity(&mut result.entities, kind, &value);
            }
        }
    }

    // "confirmed" means phase 1 got the state right; anything else is a
    // correction from the validator.
    if let Some(Value::String(validation)) = outcome.fields.get("workflow_validation") {
        let v = validation.trim();
        if !v.is_empty() && !v.eq_ignore_ascii_case("confirmed") {
            result.workflow_state = v.to_string();
        }
    }

    if let Some(conf) = outcome.fields.get("confidence").and_then(Value::as_f64) {
        if conf > result.confidence && conf <= 1.0 {
            result.confidence = conf;
        }
    }

    if let Some(Value::Array(items)) = outcome.fields.get("action_items") {
        for item in items {
            if let Some(action) = action_from_value(item) {
                push_action(result, action);
            }
        }
    }
}

fn merge_stage3(result: &mut AnalysisResult, outcome: &EnrichOutcome) {
    if let Some(Value::String(priority)) = outcome.fields.get("strategic_priority") {
        let p = priority.trim();
        if !p.is_empty() {
            result.priority = p.to_lowercase();
        }
    }

    if let Some(steps) = outcome.fields.get("next_steps") {
        for step in string_values(steps) {
            push_action(
                result,
                ActionItem {
                    task: step,
                    owner: None,
                    deadline: None,
                    priority: Some(result.priority.clone()),
                },
            );
        }
    }

    if let Some(indicators) = outcome.fields.get("completion_indicators") {
        let joined = string_values(indicators).join("; ");
        if !joined.is_empty() {
            result.summary = Some(match result.summary.take() {
                Some(existing) => format!("{} | {}", existing, joined),
                None => joined,
            });
        }
    }

    if let Some(conf) = outcome.fields.get("confidence").and_then(Value::as_f64) {
        if conf > result.confidence && conf <= 1.0 {
            result.confidence = conf;
        }
    }
}

/// Append an action item unless an equivalent (task, owner) pair exists.
fn push_action(result: &mut AnalysisResult, action: ActionItem) {
    let duplicate = result.action_items.iter().any(|existing| {
        normalize(&existing.task) == normalize(&action.task) && existing.owner == action.owner
    });
    if !duplicate {
        result.action_items.push(action);
    }
}

fn entity_kind_from_key(key: &str) -> Option<EntityKind> {
    match key {
        "po_numbers" => Some(EntityKind::PoNumbers),
        "quote_numbers" => Some(EntityKind::QuoteNumbers),
        "customers" => Some(EntityKind::Customers),
        "dollar_values" => Some(EntityKind::DollarValues),
        "dates" => Some(EntityKind::Dates),
        _ => None,
    }
}

/// Flatten a JSON value into the strings it carries: a string yields
/// itself, an array yields its string elements.
fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn action_from_value(value: &Value) -> Option<ActionItem> {
    let obj = value.as_object()?;
    let task = obj.get("task")?.as_str()?.trim().to_string();
    if task.is_empty() {
        return None;
    }
    let get_str = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    Some(ActionItem {
        task,
        owner: get_str("owner"),
        deadline: get_str("deadline"),
        priority: get_str("priority"),
    })
}
