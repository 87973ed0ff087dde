//! Phase routing: decide how many analysis stages an item gets.
//!
//! Pure decision function over already-computed signals. Phase 1 is free and
//! always runs; phase 2 runs unless the caller asked for extraction only;
//! phase 3 is reserved for complete, high-value or critical chains — this is
//! the pipeline's cost/quality tradeoff.

use crate::config::RoutingConfig;
use crate::models::{ChainAnalysis, PhasePlan, Urgency, ValueSignal};

/// Caller-supplied routing overrides (from CLI flags).
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingOverrides {
    /// Run every phase regardless of completeness or value.
    pub force_all_phases: bool,
    /// Suppress phases 2 and 3 — pure local extraction.
    pub extract_only: bool,
}

pub fn select_phases(
    analysis: &ChainAnalysis,
    signal: &ValueSignal,
    routing: &RoutingConfig,
    overrides: &RoutingOverrides,
) -> PhasePlan {
    if overrides.extract_only {
        return PhasePlan {
            run_phase2: false,
            run_phase3: false,
        };
    }

    let run_phase3 = analysis.is_complete
        && (signal.dollar_value > routing.phase3_dollar_threshold
            || signal.urgency == Urgency::Critical
            || overrides.force_all_phases);

    PhasePlan {
        run_phase2: true,
        run_phase3,
    }
}
