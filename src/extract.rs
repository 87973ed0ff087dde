//! Phase 1: local rule-based extraction.
//!
//! Pulls typed entities (PO numbers, quote numbers, dollar values, dates,
//! customer names), an urgency signal, and baseline workflow/priority fields
//! out of raw email text. Runs for every item, costs nothing, and is never
//! skipped — later phases can only add to what this produces.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{ActionItem, AnalysisResult, EntityKind, Item, Urgency};

fn po_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bP\.?O\.?\s*#?\s*(\d{4,10})\b").unwrap())
}

fn quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bquot(?:e|ation)\s*(?:number|no\.?|#)?\s*[:#]?\s*([A-Z]{0,3}-?\d{3,10})\b")
            .unwrap()
    })
}

fn dollar_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\s?([0-9][0-9,]*(?:\.[0-9]{1,2})?)([kK])?\b").unwrap())
}

fn date_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap(),
            Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b").unwrap(),
            Regex::new(
                r"(?i)\b((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,?\s+\d{4})?)\b",
            )
            .unwrap(),
        ]
    })
}

fn greeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:[Hh]i|[Hh]ello|[Dd]ear)\s+([A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+)?)[,\s]")
            .unwrap()
    })
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)\b(?:please|kindly|we need to|you need to)\s+([^.\n]{5,140})").unwrap()
    })
}

const CRITICAL_KEYWORDS: &[&str] = &["urgent", "asap", "immediately", "critical", "emergency"];
const HIGH_KEYWORDS: &[&str] = &["as soon as possible", "priority", "by end of day", "eod", "deadline"];

/// Run phase-1 extraction over one item, producing the baseline result.
pub fn analyze_item(item: &Item) -> AnalysisResult {
    let text = format!("{}\n{}", item.subject, item.body);

    let mut entities: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();

    collect_captures(po_re(), &text, EntityKind::PoNumbers, &mut entities);
    collect_captures(quote_re(), &text, EntityKind::QuoteNumbers, &mut entities);

    for cap in dollar_re().captures_iter(&text) {
        // A k suffix ("$60k") is shorthand for thousands; store the
        // expanded value so downstream threshold checks see 60000, not 60.
        if cap.get(2).is_some() {
            if let Ok(n) = cap[1].replace(',', "").parse::<f64>() {
                push_entity(
                    &mut entities,
                    EntityKind::DollarValues,
                    &format!("${}", (n * 1000.0).round()),
                );
                continue;
            }
        }
        push_entity(&mut entities, EntityKind::DollarValues, &format!("${}", &cap[1]));
    }
    for re in date_res() {
        collect_captures(re, &text, EntityKind::Dates, &mut entities);
    }

    if let Some(name) = sender_display_name(&item.sender) {
        push_entity(&mut entities, EntityKind::Customers, &name);
    }
    for cap in greeting_re().captures_iter(&item.body) {
        push_entity(&mut entities, EntityKind::Customers, &cap[1]);
    }

    let urgency = detect_urgency(&text);
    let action_items = extract_action_items(&text, &item.sender);
    let workflow_state = workflow_state_heuristic(&text);

    let dollar_max = entities
        .get(&EntityKind::DollarValues)
        .map(|vals| {
            vals.iter()
                .filter_map(|v| v.trim_start_matches('$').replace(',', "").parse::<f64>().ok())
                .fold(0.0, f64::max)
        })
        .unwrap_or(0.0);

    let priority = match urgency {
        Urgency::Critical => "high",
        Urgency::High => "high",
        Urgency::Normal if dollar_max >= 10_000.0 => "high",
        Urgency::Normal if dollar_max > 0.0 => "normal",
        Urgency::Normal => "low",
    };

    // Baseline confidence grows with the number of entity kinds found.
    let confidence = (0.5 + 0.1 * entities.len() as f64).min(0.9);

    AnalysisResult {
        entities,
        workflow_state,
        priority: priority.to_string(),
        urgency,
        confidence,
        action_items,
        phases_run: 1,
        summary: None,
    }
}

fn collect_captures(
    re: &Regex,
    text: &str,
    kind: EntityKind,
    entities: &mut BTreeMap<EntityKind, Vec<String>>,
) {
    for cap in re.captures_iter(text) {
        push_entity(entities, kind, &cap[1]);
    }
}

/// Append a value, skipping case-insensitive duplicates within the kind.
pub fn push_entity(entities: &mut BTreeMap<EntityKind, Vec<String>>, kind: EntityKind, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let normalized = normalize(value);
    let list = entities.entry(kind).or_default();
    if !list.iter().any(|v| normalize(v) == normalized) {
        list.push(value.to_string());
    }
}

/// Canonical form used for dedup: lowercase, whitespace collapsed,
/// trailing punctuation stripped.
pub fn normalize(value: &str) -> String {
    value
        .trim()
        .trim_end_matches(['.', ',', ';', ':'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn detect_urgency(text: &str) -> Urgency {
    let lower = text.to_lowercase();
    if CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Urgency::Critical
    } else if HIGH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Urgency::High
    } else {
        Urgency::Normal
    }
}

fn workflow_state_heuristic(text: &str) -> String {
    let lower = text.to_lowercase();
    if ["delivered", "resolved", "completed", "closed", "all set"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "resolution".to_string()
    } else if ["re:", "fw:", "follow up", "update"].iter().any(|k| lower.contains(k)) {
        "in_progress".to_string()
    } else {
        "intake".to_string()
    }
}

fn extract_action_items(text: &str, sender: &str) -> Vec<ActionItem> {
    let mut items = Vec::new();
    for cap in action_re().captures_iter(text) {
        let task = cap[1].trim().to_string();
        // Reuse the first date in the task line as a deadline, if present.
        let deadline = date_res()
            .iter()
            .find_map(|re| re.captures(&task).map(|c| c[1].to_string()));
        let item = ActionItem {
            task,
            owner: sender_display_name(sender),
            deadline,
            priority: None,
        };
        if !items
            .iter()
            .any(|existing: &ActionItem| normalize(&existing.task) == normalize(&item.task))
        {
            items.push(item);
        }
    }
    items
}

/// Display name from an RFC-style sender: `Jane Doe <jane@acme.com>` → `Jane Doe`.
/// Bare addresses yield nothing — an email address is not a customer name.
fn sender_display_name(sender: &str) -> Option<String> {
    let name = match sender.find('<') {
        Some(pos) => sender[..pos].trim().trim_matches('"'),
        None => return None,
    };
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemStatus;

    fn item_with(subject: &str, body: &str, sender: &str) -> Item {
        Item {
            id: "i1".to_string(),
            chain_key: "c1".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            sender: sender.to_string(),
            received_at: 100,
            has_attachments: false,
            status: ItemStatus::Pending,
            workflow_state: None,
            priority: None,
            confidence: None,
            analyzed_at: None,
        }
    }

    #[test]
    fn extracts_po_and_quote_numbers() {
        let item = item_with(
            "RE: PO #482910",
            "Referencing quote Q-10293 for the pending order.",
            "Jane Doe <jane@acme.com>",
        );
        let result = analyze_item(&item);
        assert_eq!(result.entities[&EntityKind::PoNumbers], vec!["482910"]);
        assert_eq!(result.entities[&EntityKind::QuoteNumbers], vec!["Q-10293"]);
        assert_eq!(result.entities[&EntityKind::Customers], vec!["Jane Doe"]);
        assert_eq!(result.phases_run, 1);
    }

    #[test]
    fn extracts_dollar_values_and_dates() {
        let item = item_with(
            "Order total",
            "The total comes to $12,500.00, due by 2025-11-30 or 3/15/2026.",
            "bob@example.com",
        );
        let result = analyze_item(&item);
        assert_eq!(
            result.entities[&EntityKind::DollarValues],
            vec!["$12,500.00"]
        );
        let dates = &result.entities[&EntityKind::Dates];
        assert!(dates.contains(&"2025-11-30".to_string()));
        assert!(dates.contains(&"3/15/2026".to_string()));
    }

    #[test]
    fn k_suffix_dollar_values_scale_to_thousands() {
        let item = item_with(
            "Budget check",
            "We have budget around $60k, maybe $2.5k extra for freight.",
            "a@b.c",
        );
        let result = analyze_item(&item);
        assert_eq!(
            result.entities[&EntityKind::DollarValues],
            vec!["$60000", "$2500"]
        );
        assert_eq!(result.max_dollar_value(), 60_000.0);
    }

    #[test]
    fn urgency_detection() {
        let urgent = item_with("URGENT: line down", "need this ASAP", "a@b.c");
        assert_eq!(analyze_item(&urgent).urgency, Urgency::Critical);
        assert_eq!(analyze_item(&urgent).priority, "high");

        let calm = item_with("weekly notes", "nothing pressing here", "a@b.c");
        assert_eq!(analyze_item(&calm).urgency, Urgency::Normal);
    }

    #[test]
    fn action_items_deduplicate() {
        let item = item_with(
            "follow up",
            "Please send the revised contract by 2025-12-01.\nPlease send the revised contract by 2025-12-01.",
            "Jane Doe <jane@acme.com>",
        );
        let result = analyze_item(&item);
        assert_eq!(result.action_items.len(), 1);
        let action = &result.action_items[0];
        assert!(action.task.contains("send the revised contract"));
        assert_eq!(action.deadline.as_deref(), Some("2025-12-01"));
        assert_eq!(action.owner.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn entity_dedup_is_case_insensitive() {
        let mut entities = BTreeMap::new();
        push_entity(&mut entities, EntityKind::Customers, "Acme Corp");
        push_entity(&mut entities, EntityKind::Customers, "acme corp");
        push_entity(&mut entities, EntityKind::Customers, "ACME  CORP.");
        assert_eq!(entities[&EntityKind::Customers], vec!["Acme Corp"]);
    }

    #[test]
    fn bare_address_is_not_a_customer() {
        let item = item_with("hi", "short note", "jane@acme.com");
        let result = analyze_item(&item);
        assert!(!result.entities.contains_key(&EntityKind::Customers));
    }
}
