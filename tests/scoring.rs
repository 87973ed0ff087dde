//! Completeness scoring over a synthetic corpus.
//!
//! Verifies the score is a genuine gradient — chains missing indicator
//! classes land at intermediate values — rather than collapsing to 0/100.

use mailflow::completeness::score_chain;
use mailflow::config::ScoringConfig;
use mailflow::models::{Chain, ChainType, Item, ItemStatus};

fn email(id: usize, chain_key: &str, subject: &str, body: &str, ts: i64) -> Item {
    Item {
        id: format!("{}-{}", chain_key, id),
        chain_key: chain_key.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        sender: "sender@example.com".to_string(),
        received_at: ts,
        has_attachments: false,
        status: ItemStatus::Pending,
        workflow_state: None,
        priority: None,
        confidence: None,
        analyzed_at: None,
    }
}

/// Build a chain with the requested indicator classes and length. Filler
/// emails carry no indicator language at all.
fn synthetic_chain(key: &str, start: bool, middle: bool, end: bool, len: usize) -> Chain {
    let mut items = Vec::new();
    let mut ts = 0i64;
    let mut next_ts = || {
        ts += 3600;
        ts
    };

    if start {
        items.push(email(
            items.len(),
            key,
            "Quote request for replacement parts",
            "We are looking for pricing on spare rollers.",
            next_ts(),
        ));
    }
    if middle {
        items.push(email(
            items.len(),
            key,
            "RE: replacement parts",
            "Details attached, per our call.",
            next_ts(),
        ));
    }
    if end {
        items.push(email(
            items.len(),
            key,
            "parts update",
            "All set, shipped and delivered, thank you.",
            next_ts(),
        ));
    }
    while items.len() < len {
        items.push(email(
            items.len(),
            key,
            "notes",
            "general correspondence without signal words",
            next_ts(),
        ));
    }

    Chain {
        chain_key: key.to_string(),
        items,
    }
}

#[test]
fn indicator_subsets_produce_a_gradient() {
    let scoring = ScoringConfig::default();

    // (start, middle, end, length) -> expected score
    let cases: &[(bool, bool, bool, usize, u32)] = &[
        (false, false, false, 1, 0),
        (true, false, false, 1, 35),
        (false, true, false, 1, 30),
        (false, false, true, 1, 35),
        (true, true, false, 2, 65),
        (true, false, true, 2, 70),
        (false, true, true, 2, 65),
        (true, true, true, 3, 100),
        (true, true, false, 3, 75),
        (true, true, false, 5, 85),
    ];

    for (i, &(start, middle, end, len, expected)) in cases.iter().enumerate() {
        let chain = synthetic_chain(&format!("chain-{}", i), start, middle, end, len);
        let analysis = score_chain(&chain, &scoring);
        assert_eq!(
            analysis.completeness_score, expected,
            "case {} (start={} middle={} end={} len={})",
            i, start, middle, end, len
        );
        assert_eq!(analysis.is_complete, expected >= scoring.complete_threshold);
        assert_eq!(analysis.has_start, start);
        assert_eq!(analysis.has_middle, middle);
        assert_eq!(analysis.has_end, end);
        assert_eq!(
            analysis.missing_elements.len(),
            [start, middle, end].iter().filter(|p| !**p).count()
        );
    }
}

#[test]
fn corpus_scores_are_not_bimodal() {
    let scoring = ScoringConfig::default();
    let mut scores = Vec::new();

    // 56 chains cycling through every indicator subset and several lengths.
    let mut n = 0usize;
    for len in [1usize, 2, 3, 4, 5, 6, 7] {
        for mask in 0u8..8 {
            let start = mask & 1 != 0;
            let middle = mask & 2 != 0;
            let end = mask & 4 != 0;
            let chain = synthetic_chain(&format!("c{}", n), start, middle, end, len);
            n += 1;
            scores.push(score_chain(&chain, &scoring).completeness_score);
        }
    }

    assert!(scores.len() >= 50);
    let extreme = scores.iter().filter(|&&s| s == 0 || s == 100).count();
    assert!(
        (extreme as f64) < 0.8 * scores.len() as f64,
        "scores collapsed to the extremes: {} of {}",
        extreme,
        scores.len()
    );

    // At least four distinct intermediate values must appear.
    let mut intermediate: Vec<u32> = scores
        .iter()
        .copied()
        .filter(|&s| s > 0 && s < 100)
        .collect();
    intermediate.sort_unstable();
    intermediate.dedup();
    assert!(
        intermediate.len() >= 4,
        "too few distinct intermediate scores: {:?}",
        intermediate
    );
}

#[test]
fn chain_typing_matches_subject_matter() {
    let scoring = ScoringConfig::default();

    let quote = synthetic_chain("q", true, true, true, 3);
    assert_eq!(score_chain(&quote, &scoring).chain_type, ChainType::QuoteRequest);

    let support = Chain {
        chain_key: "s".to_string(),
        items: vec![email(
            0,
            "s",
            "Printer not working",
            "The unit shows an error and needs support.",
            1,
        )],
    };
    assert_eq!(score_chain(&support, &scoring).chain_type, ChainType::Support);
}
