//! The refinement sweep: a state machine that drains mutator-dirtied
//! cards from the refinement table into per-region remembered sets.
//!
//! The process steps are:
//!
//! 1. Swap the global card table pointers.
//! 2. Handshake the new pointer into every mutator thread.
//! 3. Rendezvous the GC threads for memory visibility.
//!
//! After this point no mutator dirties the refinement table.
//!
//! 4. Snapshot the heap: decide which regions need sweeping.
//! 5. Sweep the refinement table, refining every non-clean card.
//! 6. Completion work: statistics, reset to idle.
//!
//! A safepoint-bound GC can interrupt the machine at any state and force
//! it back to idle; half-done sweep claims become the STW merge phase's
//! responsibility.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use enum_map::{Enum, EnumMap};
use strum_macros::IntoStaticStr;

use crate::heap::card_table::{self, CardTable, ChunkScanner};
use crate::heap::{ChunkClaimer, ClaimTable, Heap};
use crate::scheduler::WorkerTask;
use crate::util::constants::BYTES_IN_CARD;
use crate::util::MemRegion;
use crate::vm;

use super::stats::RefineStats;

/// Outcome of refining one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineResult {
    /// The card holds at least one reference into the collection set.
    HasRefToCSet,
    /// The card table already recorded this card as pointing into the
    /// collection set.
    AlreadyToCSet,
    /// The card holds a reference into an old region, but none into the
    /// collection set.
    HasRefToOld,
    /// No cross-region reference found.
    NoCrossRegion,
    /// The covered range is not parsable right now; retry later.
    CouldNotParse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Enum, IntoStaticStr)]
#[repr(u8)]
pub enum RefineState {
    Idle,
    SwapGlobalCT,
    SwapJavaThreadsCT,
    SynchronizeGCThreads,
    SnapshotHeap,
    SweepRT,
    CompleteRefineWork,
}

impl RefineState {
    fn from_u8(raw: u8) -> RefineState {
        match raw {
            0 => RefineState::Idle,
            1 => RefineState::SwapGlobalCT,
            2 => RefineState::SwapJavaThreadsCT,
            3 => RefineState::SynchronizeGCThreads,
            4 => RefineState::SnapshotHeap,
            5 => RefineState::SweepRT,
            _ => RefineState::CompleteRefineWork,
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Tracks the sweep from idle to completion and back.
pub struct SweepState {
    state: AtomicU8,
    /// Which cards of which regions are still to sweep. Saturated claims
    /// exclude a region.
    sweep_table: ClaimTable,
    state_start: spin::Mutex<EnumMap<RefineState, Option<Instant>>>,
    stats: spin::Mutex<RefineStats>,
}

impl SweepState {
    pub fn new(heap: &Heap) -> SweepState {
        let geometry = heap.geometry();
        SweepState {
            state: AtomicU8::new(RefineState::Idle as u8),
            sweep_table: ClaimTable::new(
                geometry.num_regions(),
                geometry.cards_per_region(),
                geometry.chunks_per_region(),
            ),
            state_start: spin::Mutex::new(EnumMap::default()),
            stats: spin::Mutex::new(RefineStats::default()),
        }
    }

    pub fn state(&self) -> RefineState {
        RefineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() != RefineState::Idle
    }

    /// After this state mutators no longer write through the old table.
    pub fn are_java_threads_synched(&self) -> bool {
        !self.is_in_progress() || self.state() > RefineState::SwapJavaThreadsCT
    }

    pub fn sweep_table(&self) -> &ClaimTable {
        &self.sweep_table
    }

    pub fn stats(&self) -> RefineStats {
        self.stats.lock().clone()
    }

    fn assert_state(&self, expected: RefineState) {
        debug_assert_eq!(
            self.state(),
            expected,
            "must be {} but is {}",
            expected.name(),
            self.state().name()
        );
    }

    fn set_state_start_time(&self) {
        self.state_start.lock()[self.state()] = Some(Instant::now());
    }

    fn duration_since(&self, start: RefineState) -> std::time::Duration {
        let starts = self.state_start.lock();
        match (starts[start], starts[self.state()]) {
            (Some(from), Some(to)) => to.duration_since(from),
            _ => std::time::Duration::ZERO,
        }
    }

    /// Move on to `next_state` unless a safepoint GC forced the machine
    /// back to idle in the meantime. Returns whether the sweep is still in
    /// progress.
    fn advance_state(&self, next_state: RefineState) -> bool {
        let in_progress = self.is_in_progress();
        let new_state = if in_progress { next_state } else { RefineState::Idle };
        self.state.store(new_state as u8, Ordering::Release);
        in_progress
    }

    /// Force the machine back to idle, from any state.
    pub fn cancel(&self) {
        self.state.store(RefineState::Idle as u8, Ordering::Release);
    }

    pub fn start_work(&self) {
        self.assert_state(RefineState::Idle);
        self.state
            .store(RefineState::SwapGlobalCT as u8, Ordering::Release);
        self.set_state_start_time();
        self.stats.lock().reset();
    }

    pub fn swap_global_card_table(&self, heap: &Heap) -> bool {
        self.assert_state(RefineState::SwapGlobalCT);
        self.set_state_start_time();

        // The swap takes the thread-list lock so no new thread can cache a
        // stale base. A GC may have interrupted us and already owned the
        // tables; do nothing then.
        if self.is_in_progress() {
            heap.swap_global_card_table();
        }
        self.advance_state(RefineState::SwapJavaThreadsCT)
    }

    pub fn swap_java_threads_ct(&self, heap: &Heap) -> bool {
        self.assert_state(RefineState::SwapJavaThreadsCT);
        self.set_state_start_time();

        heap.handshake_mutator_card_tables();
        self.advance_state(RefineState::SynchronizeGCThreads)
    }

    pub fn synchronize_gc_threads(&self) -> bool {
        self.assert_state(RefineState::SynchronizeGCThreads);
        self.set_state_start_time();

        // Both the card table pointer change and any store through the old
        // pointer must be visible to every GC worker running after this.
        vm::rendezvous_gc_threads();
        self.advance_state(RefineState::SnapshotHeap)
    }

    /// Fix the set of regions to sweep. With `concurrent=false` this is
    /// the STW fallback building a snapshot from scratch at a safepoint.
    pub fn snapshot_heap(&self, heap: &Heap, concurrent: bool) {
        if concurrent {
            self.assert_state(RefineState::SnapshotHeap);
            self.set_state_start_time();
            self.snapshot_heap_inner(heap);
            self.advance_state(RefineState::SweepRT);
        } else {
            self.assert_state(RefineState::Idle);
            self.snapshot_heap_inner(heap);
        }
    }

    fn snapshot_heap_inner(&self, heap: &Heap) {
        // Start from everything claimed and selectively open the regions
        // of interest: regions committed after the snapshot stay excluded,
        // and their refinement table is all clean anyway.
        self.sweep_table.reset_all_to_claimed();
        for region in heap.regions() {
            if !region.is_free() {
                self.sweep_table.reset_to_unclaimed(region.index() as usize);
            }
        }
    }

    pub fn sweep_refinement_table_start(&self) {
        self.assert_state(RefineState::SweepRT);
        self.set_state_start_time();
    }

    /// One bounded slice of parallel sweeping. Returns true when the whole
    /// table has been swept; false when the workers yielded to a pending
    /// safepoint.
    pub fn sweep_refinement_table_step(
        &self,
        heap: &Heap,
        workers: &crate::scheduler::WorkerThreads,
        num_workers: usize,
    ) -> bool {
        self.assert_state(RefineState::SweepRT);

        let num_workers = num_workers.clamp(1, workers.max_workers());
        let task = RefineSweepTask::new(heap, self, num_workers);
        workers.run_task(&task, num_workers);

        if task.sweep_completed() {
            self.advance_state(RefineState::CompleteRefineWork);
            true
        } else {
            false
        }
    }

    /// Finish a sweep: log statistics and reset to idle. Returns whether
    /// unswept claims remain (a GC cut the sweep short), in which case the
    /// caller continues from the snapshot.
    pub fn complete_work(&self, concurrent: bool) -> bool {
        if concurrent {
            self.assert_state(RefineState::CompleteRefineWork);
        } else {
            debug_assert!(
                self.is_in_progress() && self.state() != RefineState::CompleteRefineWork,
                "unexpected state {}",
                self.state().name()
            );
        }
        let has_sweep_rt_work = self.state() == RefineState::SweepRT;

        self.set_state_start_time();
        self.stats.lock().log_summary(self.duration_since(RefineState::SwapGlobalCT));

        self.advance_state(RefineState::Idle);
        has_sweep_rt_work
    }

    pub fn add_worker_stats(&self, worker_stats: &RefineStats) {
        self.stats.lock().add(worker_stats);
    }
}

/// Examine one card of the refinement table (§refinement): walk the
/// references in the card's range, record them in the target regions'
/// remembered sets, and classify the card.
pub fn refine_card(heap: &Heap, card_index: usize, worker_id: usize) -> RefineResult {
    let ct = heap.card_table();

    // Already known to contain a reference to the collection set; skip
    // further processing.
    if ct.get(card_index) == card_table::TO_CSET_CARD {
        return RefineResult::AlreadyToCSet;
    }

    let start = ct.addr_for(card_index);
    let region = heap.region_containing(start);
    // top is stable for old and humongous regions outside safepoints.
    let scan_limit = region.top();
    if scan_limit <= start {
        // Stale card beyond the allocated part of the region.
        return RefineResult::NoCrossRegion;
    }

    let end = std::cmp::min(scan_limit, start + BYTES_IN_CARD);
    let dirty_region = MemRegion::new(start, end);
    debug_assert!(!dirty_region.is_empty());

    let mut has_ref_to_cset = false;
    let mut has_ref_to_old = false;
    let scanned_to = heap.object_scanner().scan_range(
        region.index(),
        dirty_region,
        &mut |slot, target| {
            let to = heap.region_containing(target);
            if to.index() == region.index() {
                return;
            }
            if !to.rem_set().is_tracked() {
                return;
            }
            to.rem_set().add_reference(slot, worker_id);
            if to.in_collection_set() {
                has_ref_to_cset = true;
            } else if to.is_old() {
                has_ref_to_old = true;
            }
        },
    );

    match scanned_to {
        Some(_) => {
            if has_ref_to_cset {
                RefineResult::HasRefToCSet
            } else if has_ref_to_old {
                RefineResult::HasRefToOld
            } else {
                RefineResult::NoCrossRegion
            }
        }
        // Unparsable part of the heap under a stale card. The card stays
        // dirty and is retried later.
        None => RefineResult::CouldNotParse,
    }
}

/// The parallel sweep task: workers claim card chunks per region and
/// refine every non-clean refinement table card in them.
pub struct RefineSweepTask<'a> {
    heap: &'a Heap,
    sweep_state: &'a SweepState,
    max_workers: usize,
    completed: AtomicBool,
}

impl<'a> RefineSweepTask<'a> {
    pub fn new(heap: &'a Heap, sweep_state: &'a SweepState, max_workers: usize) -> RefineSweepTask<'a> {
        RefineSweepTask {
            heap,
            sweep_state,
            max_workers,
            completed: AtomicBool::new(true),
        }
    }

    pub fn sweep_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    fn do_dirty_card(
        &self,
        rt: &CardTable,
        ct: &CardTable,
        card_index: usize,
        worker_id: usize,
        stats: &mut RefineStats,
    ) {
        let refine_start = Instant::now();
        let result = refine_card(self.heap, card_index, worker_id);
        match result {
            RefineResult::HasRefToCSet => {
                ct.set(card_index, card_table::TO_CSET_CARD);
                stats.cards_refer_to_cset += 1;
            }
            RefineResult::AlreadyToCSet => {
                ct.set(card_index, card_table::TO_CSET_CARD);
                stats.cards_already_refer_to_cset += 1;
            }
            RefineResult::NoCrossRegion => {
                stats.cards_no_cross_region += 1;
            }
            RefineResult::CouldNotParse => {
                // Could not refine: re-dirty the card table with the
                // original value so the card is retried.
                ct.set(card_index, rt.get(card_index));
                stats.cards_not_parsable += 1;
            }
            RefineResult::HasRefToOld => {}
        }
        rt.set(card_index, card_table::CLEAN_CARD);
        stats.refine_duration += refine_start.elapsed();
    }

    /// Sweep one region's share. Returns true if the worker must yield.
    fn sweep_region(&self, region_idx: usize, worker_id: usize, stats: &mut RefineStats) -> bool {
        let heap = self.heap;
        let region = heap.region(region_idx as u32);
        let sweep_table = self.sweep_state.sweep_table();

        if region.is_young() {
            // Young regions only carry pre-dirtying information; one
            // claim-all, then bulk clear.
            if sweep_table.claim_all_cards(region_idx) == 0 {
                heap.clear_refinement_table_for_region(region_idx as u32);
            }
            return false;
        }

        let ct = heap.card_table();
        let rt = heap.refinement_table();
        let region_card_base = heap.geometry().region_card_base(region_idx as u32);

        let mut claimer = ChunkClaimer::new(sweep_table, region_idx);
        while claimer.has_next() {
            let start = region_card_base + claimer.value() as usize;
            let end = start + claimer.size() as usize;

            let mut num_dirty = 0;
            ChunkScanner::new(rt, start, end).on_to_scan_cards(|dirty_l, dirty_r| {
                for card_index in dirty_l..dirty_r {
                    self.do_dirty_card(rt, ct, card_index, worker_id, stats);
                }
                num_dirty += dirty_r - dirty_l;
            });

            #[cfg(feature = "extreme_assertions")]
            assert!(rt.is_range_clean(start, end), "refinement table not clean after sweep");

            stats.cards_scanned += claimer.size() as usize;
            stats.cards_clean += claimer.size() as usize - num_dirty;

            if heap.yield_flag().should_yield() {
                return true;
            }
        }
        false
    }
}

impl WorkerTask for RefineSweepTask<'_> {
    fn name(&self) -> &'static str {
        "refinement sweep"
    }

    fn work(&self, worker_id: usize) {
        let start = Instant::now();
        let mut stats = RefineStats::default();
        let mut yielded = false;

        self.sweep_state.sweep_table().iterate_from_worker_offset(
            worker_id,
            self.max_workers,
            |region_idx| {
                yielded = self.sweep_region(region_idx, worker_id, &mut stats);
                yielded
            },
        );

        if yielded {
            self.completed.store(false, Ordering::Relaxed);
        }
        stats.sweep_duration += start.elapsed();
        self.sweep_state.add_worker_stats(&stats);
    }
}
