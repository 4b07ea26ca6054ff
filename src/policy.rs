//! The pause-time prediction interface.
//!
//! The collector's analytics engine (sizer, pause-time predictor) is an
//! external collaborator; this crate only consumes its predictions. The
//! [`Policy`] trait is that boundary. [`FixedRatePolicy`] is a
//! deterministic implementation used by tests and as a stand-in until the
//! embedding collector installs its own.

use crate::heap::Region;

/// Predictions consumed by collection set finalization and refinement
/// control. Rates are per millisecond.
pub trait Policy: Send + Sync {
    /// Predicted time to merge `cards` remembered set cards onto the card
    /// table.
    fn predict_card_merge_time_ms(&self, cards: usize) -> f64;

    /// Predicted time to scan `cards` marked cards.
    fn predict_card_scan_time_ms(&self, cards: usize) -> f64;

    /// Predicted pause-base time: refining the pending cards plus scanning
    /// the survivor remembered sets plus constant other work.
    fn predict_base_time_ms(&self, pending_cards: usize, survivor_rs_cards: usize) -> f64 {
        self.predict_card_merge_time_ms(pending_cards + survivor_rs_cards)
            + self.predict_card_scan_time_ms(pending_cards + survivor_rs_cards)
    }

    /// Predicted non-copy overhead for a young collection of the given
    /// eden length.
    fn predict_young_region_other_time_ms(&self, eden_regions: usize) -> f64;

    /// Predicted time to copy the live contents of `eden_regions` eden
    /// regions.
    fn predict_eden_copy_time_ms(&self, eden_regions: usize) -> f64;

    /// Predicted total time (merge + scan + copy) to evacuate one old
    /// region.
    fn predict_region_total_time_ms(&self, region: &Region, in_young_only_phase: bool) -> f64;

    /// Predicted mutator allocation rate in bytes/ms.
    fn predict_alloc_rate_ms(&self) -> f64;

    /// Predicted rate at which mutators dirty fresh cards, in cards/ms.
    fn predict_dirtied_cards_rate_ms(&self) -> f64;

    /// Predicted per-thread concurrent refinement rate in cards/ms.
    fn predict_concurrent_refine_rate_ms(&self) -> f64;

    /// Bytes left until the next GC is expected to trigger. Returns `None`
    /// when the estimate is temporarily unavailable (the heap lock could
    /// not be taken); callers retry shortly.
    fn try_get_available_bytes_estimate(&self) -> Option<usize>;

    /// Whether the young list length adapts to the pause goal. When false,
    /// old-region selection stops at the minimum count instead of filling
    /// the remaining time budget.
    fn use_adaptive_young_list_length(&self) -> bool {
        true
    }
}

/// A policy with fixed, configurable rates. Predictions are linear in their
/// inputs, which makes test expectations exact.
pub struct FixedRatePolicy {
    /// Cost per merged card in ms.
    pub card_merge_cost_ms: f64,
    /// Cost per scanned card in ms.
    pub card_scan_cost_ms: f64,
    /// Fixed per-young-region overhead in ms.
    pub young_other_cost_ms: f64,
    /// Copy cost per eden region in ms.
    pub eden_copy_cost_ms: f64,
    /// Evacuation cost per old region in ms.
    pub old_region_cost_ms: f64,
    /// Allocation rate in bytes/ms.
    pub alloc_rate: f64,
    /// Card dirtying rate in cards/ms.
    pub dirtying_rate: f64,
    /// Per-thread refinement rate in cards/ms.
    pub refine_rate: f64,
    /// Bytes reported until the next GC.
    pub available_bytes: usize,
}

impl Default for FixedRatePolicy {
    fn default() -> Self {
        FixedRatePolicy {
            card_merge_cost_ms: 0.001,
            card_scan_cost_ms: 0.002,
            young_other_cost_ms: 0.1,
            eden_copy_cost_ms: 1.0,
            old_region_cost_ms: 2.0,
            alloc_rate: 64.0 * 1024.0,
            dirtying_rate: 1000.0,
            refine_rate: 5000.0,
            available_bytes: 256 << 20,
        }
    }
}

impl Policy for FixedRatePolicy {
    fn predict_card_merge_time_ms(&self, cards: usize) -> f64 {
        cards as f64 * self.card_merge_cost_ms
    }

    fn predict_card_scan_time_ms(&self, cards: usize) -> f64 {
        cards as f64 * self.card_scan_cost_ms
    }

    fn predict_young_region_other_time_ms(&self, eden_regions: usize) -> f64 {
        eden_regions as f64 * self.young_other_cost_ms
    }

    fn predict_eden_copy_time_ms(&self, eden_regions: usize) -> f64 {
        eden_regions as f64 * self.eden_copy_cost_ms
    }

    fn predict_region_total_time_ms(&self, region: &Region, _in_young_only_phase: bool) -> f64 {
        self.old_region_cost_ms + self.predict_card_scan_time_ms(region.rem_set().occupied())
    }

    fn predict_alloc_rate_ms(&self) -> f64 {
        self.alloc_rate
    }

    fn predict_dirtied_cards_rate_ms(&self) -> f64 {
        self.dirtying_rate
    }

    fn predict_concurrent_refine_rate_ms(&self) -> f64 {
        self.refine_rate
    }

    fn try_get_available_bytes_estimate(&self) -> Option<usize> {
        Some(self.available_bytes)
    }
}
