//! The STW merge-and-scan heap roots protocol.
//!
//! At pause entry the sources of "cards that may hold collection set
//! references" are spread over the refinement table, the card table, and
//! every collection set region's remembered set. The phases here merge all
//! of them into a single card table snapshot, scan it in parallel, and at
//! pause end clear every card that was touched. Optional evacuation
//! increments re-run the merge and scan for additional regions while
//! `scanned` card marks prevent rescanning.

pub mod merge;
pub mod scan;
pub mod scan_state;

use std::sync::Arc;
use std::time::Instant;

use crate::heap::{Heap, Region};
use crate::refine::ConcurrentRefine;
use crate::scheduler::WorkerThreads;
use crate::util::options::Options;

pub use scan::{EvacuationSink, ScanStats};
pub use scan_state::ScanState;

/// Heap-level remembered set coordination for the STW pause: owns the scan
/// state and drives the merge, scan and cleanup phases.
pub struct HeapRemSet {
    heap: Arc<Heap>,
    refine: Arc<ConcurrentRefine>,
    options: Arc<Options>,
    scan_state: ScanState,
}

impl HeapRemSet {
    pub fn new(heap: Arc<Heap>, refine: Arc<ConcurrentRefine>, options: Arc<Options>) -> HeapRemSet {
        HeapRemSet {
            scan_state: ScanState::new(&heap),
            heap,
            refine,
            options,
        }
    }

    pub fn scan_state(&self) -> &ScanState {
        &self.scan_state
    }

    /// Phase 0, pause entry: reset the scan state.
    pub fn prepare_for_scan_heap_roots(&self) {
        self.scan_state.prepare();
    }

    /// Phase 0, per region: initialize the scan top and queue old and
    /// humongous regions for scanning. Collection set regions are
    /// evacuated, never scanned; young regions have no stable content to
    /// scan.
    pub fn prepare_region_for_scan(&self, region: &Region) {
        let region_idx = region.index();
        if region.in_collection_set() {
            debug_assert!(self.scan_state.scan_top(region_idx).is_none());
        } else if region.is_old_or_humongous() {
            self.scan_state.set_scan_top(region_idx, region.top());
            self.scan_state.add_dirty_region(region_idx);
        } else {
            debug_assert!(self.scan_state.scan_top(region_idx).is_none());
            debug_assert!(
                region.is_free() || region.is_young(),
                "region {} should be free or young but is {:?}",
                region_idx,
                region.kind()
            );
        }
    }

    /// Convenience for pause entry: phase 0 over the whole heap.
    pub fn prepare_all_regions_for_scan(&self) {
        self.prepare_for_scan_heap_roots();
        for region in self.heap.regions() {
            if !region.is_free() {
                self.prepare_region_for_scan(region);
            }
        }
    }

    /// Phases 1 and 2: merge the refinement table (if concurrent
    /// refinement left work behind) and the collection set remembered sets
    /// into the card table.
    pub fn merge_heap_roots(
        &self,
        workers: &WorkerThreads,
        cset_regions: &[u32],
        initial_evacuation: bool,
    ) -> merge::MergeStats {
        let start = Instant::now();

        self.scan_state.prepare_for_merge_heap_roots();

        if initial_evacuation && self.refine.sweep_state().is_in_progress() {
            let sweep_state = self.refine.sweep_state_for_merge();
            let task = merge::MergeRefinementTableTask::new(
                &self.heap,
                sweep_state.sweep_table(),
                workers.max_workers(),
            );
            workers.run_task(&task, workers.max_workers());
        }

        let num_workers = if initial_evacuation {
            workers.max_workers()
        } else {
            workers.max_workers().min(cset_regions.len().max(1))
        };
        let task = merge::MergeHeapRootsTask::new(
            &self.heap,
            &self.scan_state,
            cset_regions,
            initial_evacuation,
            *self.options.merge_heap_roots_prefetch_cache_size,
            *self.options.eager_reclaim_remset_threshold,
        );
        workers.run_task(&task, num_workers);
        let stats = task.stats();

        debug!(
            "merge heap roots ({}): {} regions, {} cards ({} fresh) in {:.2}ms",
            if initial_evacuation { "initial" } else { "optional" },
            cset_regions.len(),
            stats.total_cards,
            stats.merged_cards,
            start.elapsed().as_secs_f64() * 1000.0
        );
        stats
    }

    /// Phase 3: scan the merged card table. With
    /// `remember_already_scanned_cards` the scanned cards are left marked
    /// so a later increment skips them.
    pub fn scan_heap_roots(
        &self,
        workers: &WorkerThreads,
        sink: &dyn EvacuationSink,
        remember_already_scanned_cards: bool,
    ) -> ScanStats {
        let task = scan::ScanHeapRootsTask::new(
            &self.heap,
            &self.scan_state,
            sink,
            workers.max_workers(),
            remember_already_scanned_cards,
        );
        workers.run_task(&task, workers.max_workers());
        let stats = task.stats();
        debug!(
            "scan heap roots: pending {} scanned {} empty {} blocks {} chunks {} roots {}",
            stats.cards_pending,
            stats.cards_scanned,
            stats.cards_empty,
            stats.blocks_scanned,
            stats.chunks_claimed,
            stats.heap_roots_found
        );
        stats
    }

    /// End of one evacuation increment.
    pub fn complete_evac_phase(&self, has_more_than_one_evacuation_phase: bool) {
        self.scan_state.complete_evac_phase(has_more_than_one_evacuation_phase);
    }

    /// An evacuation-failed or reused region must not be scanned.
    pub fn exclude_region_from_scan(&self, region_idx: u32) {
        self.scan_state.clear_scan_top(region_idx);
    }

    /// Re-register an optional region that was pulled into a later
    /// increment's collection set, or abandoned back to old.
    pub fn register_region_for_scan(&self, region: &Region) {
        self.prepare_region_for_scan(region);
    }

    /// Phase 5: clear every scribbled card table range back to clean and
    /// drop the pause-local state.
    pub fn cleanup_after_scan_heap_roots(&self, workers: &WorkerThreads) {
        let task = scan_state::ClearCardTableTask::new(&self.heap, &self.scan_state);
        workers.run_task(&task, workers.max_workers());

        #[cfg(feature = "extreme_assertions")]
        {
            let total = self.heap.geometry().total_cards();
            assert!(
                self.heap.card_table().is_range_clean(0, total),
                "card table not clean after pause cleanup"
            );
        }
    }

    /// Pause-end refinement bookkeeping: report what the pause processed
    /// so the refinement control can re-derive its pending cards target,
    /// and account the pending cards as consumed.
    pub fn adjust_refinement_after_gc(&self, pending_cards_time_ms: f64, processed_pending_cards: usize) {
        let goal_ms = *self.options.rset_updating_pause_time_percent as f64 / 100.0
            * *self.options.max_gc_pause_millis as f64;
        self.refine
            .adjust_after_gc(pending_cards_time_ms, processed_pending_cards, goal_ms);
        self.refine.reset_pending_cards();
    }
}
