//! Chain derivation.
//!
//! Chains are never stored: they are computed on demand from items grouped
//! by conversation key, with items ordered by timestamp so derived fields
//! ("last email", duration) are stable.

use crate::models::{Chain, Item};

/// Group items into chains by conversation key.
///
/// Items within each chain are sorted by `received_at` (ties broken by id
/// for determinism). Chains come back in first-seen key order.
pub fn group_into_chains(items: Vec<Item>) -> Vec<Chain> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: std::collections::HashMap<String, Vec<Item>> = std::collections::HashMap::new();

    for item in items {
        if !by_key.contains_key(&item.chain_key) {
            order.push(item.chain_key.clone());
        }
        by_key.entry(item.chain_key.clone()).or_default().push(item);
    }

    order
        .into_iter()
        .map(|key| {
            let mut items = by_key.remove(&key).unwrap_or_default();
            items.sort_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Chain {
                chain_key: key,
                items,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemStatus;

    fn item(id: &str, chain_key: &str, ts: i64) -> Item {
        Item {
            id: id.to_string(),
            chain_key: chain_key.to_string(),
            subject: String::new(),
            body: String::new(),
            sender: String::new(),
            received_at: ts,
            has_attachments: false,
            status: ItemStatus::Pending,
            workflow_state: None,
            priority: None,
            confidence: None,
            analyzed_at: None,
        }
    }

    #[test]
    fn groups_and_orders_by_timestamp() {
        let chains = group_into_chains(vec![
            item("c", "alpha", 30),
            item("a", "alpha", 10),
            item("x", "beta", 5),
            item("b", "alpha", 20),
        ]);
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].chain_key, "alpha");
        let ids: Vec<&str> = chains[0].items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(chains[1].items.len(), 1);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let chains = group_into_chains(vec![item("b", "k", 10), item("a", "k", 10)]);
        assert_eq!(chains[0].items[0].id, "a");
    }
}
