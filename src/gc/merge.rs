//! STW merge of heap root sources onto the card table.
//!
//! Phase 1 folds whatever the interrupted refinement sweep left in the
//! refinement table into the card table, word at a time. Phase 2 drops
//! every collection set region's remembered set (and the remembered sets
//! of humongous eager-reclaim candidates) onto the card table as
//! `from_remset` marks. After both, the union of non-clean cards is
//! exactly what must be scanned.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cardset::containers::IterateTag;
use crate::cardset::rem_set::MergeCardVisitor;
use crate::heap::card_table::CardTable;
use crate::heap::{ChunkClaimer, ClaimTable, Heap};
use crate::scheduler::WorkerTask;
use crate::util::constants::BYTES_IN_WORD;

/// Per-worker merge statistics: how many containers of each shape were
/// merged, how many cards they produced, and how many card marks were
/// freshly written.
#[derive(Default, Clone)]
pub struct MergeStats {
    pub merged_inline: usize,
    pub merged_array: usize,
    pub merged_bitmap: usize,
    pub merged_howl: usize,
    pub merged_full: usize,
    /// Cards newly marked `from_remset`.
    pub merged_cards: usize,
    /// All cards delivered by remembered sets, including already-dirty
    /// ones.
    pub total_cards: usize,
}

impl MergeStats {
    fn inc_container(&mut self, tag: IterateTag) {
        match tag {
            IterateTag::Inline => self.merged_inline += 1,
            IterateTag::Array => self.merged_array += 1,
            IterateTag::Bitmap => self.merged_bitmap += 1,
            IterateTag::Howl => self.merged_howl += 1,
            IterateTag::Full => self.merged_full += 1,
        }
    }

    pub fn add(&mut self, other: &MergeStats) {
        self.merged_inline += other.merged_inline;
        self.merged_array += other.merged_array;
        self.merged_bitmap += other.merged_bitmap;
        self.merged_howl += other.merged_howl;
        self.merged_full += other.merged_full;
        self.merged_cards += other.merged_cards;
        self.total_cards += other.total_cards;
    }
}

/// Merges one remembered set's cards onto the card table.
///
/// Dropping cards onto the card table is close to random memory access; a
/// small ring of upcoming card indices is kept in front of the actual
/// marking to give the hardware prefetcher a head start.
pub struct MergeCardSetClosure<'a> {
    heap: &'a Heap,
    scan_state: &'a super::scan_state::ScanState,
    ct: &'a CardTable,
    stats: MergeStats,
    /// Card-table base index of the region currently being merged.
    region_base_idx: usize,
    cache: Vec<usize>,
    cache_idx: usize,
}

/// Ring slot that produces no work when processed.
const MERGE_CACHE_EMPTY: usize = usize::MAX;

impl<'a> MergeCardSetClosure<'a> {
    pub fn new(
        heap: &'a Heap,
        scan_state: &'a super::scan_state::ScanState,
        cache_size: usize,
    ) -> MergeCardSetClosure<'a> {
        debug_assert!(cache_size.is_power_of_two());
        MergeCardSetClosure {
            heap,
            scan_state,
            ct: heap.card_table(),
            stats: MergeStats::default(),
            region_base_idx: 0,
            cache: vec![MERGE_CACHE_EMPTY; cache_size],
            cache_idx: 0,
        }
    }

    fn remember_if_interesting(&mut self, region_idx: u32) -> bool {
        if !self.scan_state.contains_cards_to_process(self.heap, region_idx) {
            return false;
        }
        self.scan_state.add_dirty_region(region_idx);
        true
    }

    fn mark_card(&mut self, card_index: usize) {
        if card_index == MERGE_CACHE_EMPTY {
            return;
        }
        if self.ct.mark_clean_as_from_remset(card_index) {
            self.stats.merged_cards += 1;
        }
        self.stats.total_cards += 1;
    }

    fn push(&mut self, card_index: usize) -> usize {
        let evicted = self.cache[self.cache_idx];
        self.cache[self.cache_idx] = card_index;
        self.cache_idx = (self.cache_idx + 1) & (self.cache.len() - 1);
        evicted
    }

    /// Drain the ring. Must be called before reading the statistics.
    pub fn flush(&mut self) {
        for _ in 0..self.cache.len() {
            let evicted = self.push(MERGE_CACHE_EMPTY);
            self.mark_card(evicted);
        }
    }

    pub fn into_stats(mut self) -> MergeStats {
        self.flush();
        self.stats
    }
}

impl MergeCardVisitor for MergeCardSetClosure<'_> {
    fn start_iterate(&mut self, tag: IterateTag, region_idx: u32) -> bool {
        if self.remember_if_interesting(region_idx) {
            self.region_base_idx = self.heap.geometry().region_card_base(region_idx);
            self.stats.inc_container(tag);
            return true;
        }
        false
    }

    fn do_card(&mut self, card_in_region: u32) {
        let to_process = self.push(self.region_base_idx + card_in_region as usize);
        self.mark_card(to_process);
    }

    fn do_card_range(&mut self, start_card: u32, length: u32) {
        let start = self.region_base_idx + start_card as usize;
        self.stats.merged_cards += self.ct.mark_clean_range_as_from_remset(start, length as usize);
        self.stats.total_cards += length as usize;
    }
}

/// Phase 1: fold the refinement table into the card table for every
/// region the interrupted sweep still had claims on.
pub struct MergeRefinementTableTask<'a> {
    heap: &'a Heap,
    sweep_table: &'a ClaimTable,
    max_workers: usize,
}

impl<'a> MergeRefinementTableTask<'a> {
    pub fn new(
        heap: &'a Heap,
        sweep_table: &'a ClaimTable,
        max_workers: usize,
    ) -> MergeRefinementTableTask<'a> {
        MergeRefinementTableTask {
            heap,
            sweep_table,
            max_workers,
        }
    }

    fn merge_region(&self, region_idx: usize) {
        let heap = self.heap;
        let region = heap.region(region_idx as u32);

        // Collection set regions will be evacuated: their refinement table
        // contents are uninteresting (young regions hold random
        // pre-dirtying marks) and just need resetting for the evacuation
        // failure paths.
        if region.in_collection_set() {
            let claim = self.sweep_table.claim_all_cards(region_idx);
            if claim < heap.geometry().cards_per_region() {
                heap.clear_refinement_table_for_region(region_idx as u32);
            }
            return;
        }

        debug_assert!(region.is_old_or_humongous(), "unexpected {:?}", region.kind());

        let ct = heap.card_table();
        let rt = heap.refinement_table();
        let region_card_base = heap.geometry().region_card_base(region_idx as u32);

        let mut claimer = ChunkClaimer::new(self.sweep_table, region_idx);
        while claimer.has_next() {
            let start = region_card_base + claimer.value() as usize;
            let end = start + claimer.size() as usize;
            // Dirty is all-zero and clean all-one, so AND keeps any
            // non-clean mark from either table.
            for word in start / BYTES_IN_WORD..end / BYTES_IN_WORD {
                let value = rt.take_word(word);
                ct.merge_word(word, value);
            }
        }
    }
}

impl WorkerTask for MergeRefinementTableTask<'_> {
    fn name(&self) -> &'static str {
        "merge refinement table"
    }

    fn work(&self, worker_id: usize) {
        self.sweep_table
            .iterate_from_worker_offset(worker_id, self.max_workers, |region_idx| {
                self.merge_region(region_idx);
                false
            });
    }
}

/// Phase 2: merge remembered sets into the card table and prepare the
/// collection set regions for evacuation failure handling.
pub struct MergeHeapRootsTask<'a> {
    heap: &'a Heap,
    scan_state: &'a super::scan_state::ScanState,
    /// Collection set regions of the current increment.
    cset_regions: &'a [u32],
    cset_claim: AtomicUsize,
    evac_prepare_claim: AtomicUsize,
    initial_evacuation: bool,
    fast_reclaim_handled: AtomicBool,
    prefetch_cache_size: usize,
    eager_reclaim_threshold: usize,
    stats: spin::Mutex<MergeStats>,
}

impl<'a> MergeHeapRootsTask<'a> {
    pub fn new(
        heap: &'a Heap,
        scan_state: &'a super::scan_state::ScanState,
        cset_regions: &'a [u32],
        initial_evacuation: bool,
        prefetch_cache_size: usize,
        eager_reclaim_threshold: usize,
    ) -> MergeHeapRootsTask<'a> {
        MergeHeapRootsTask {
            heap,
            scan_state,
            cset_regions,
            cset_claim: AtomicUsize::new(0),
            evac_prepare_claim: AtomicUsize::new(0),
            initial_evacuation,
            fast_reclaim_handled: AtomicBool::new(false),
            prefetch_cache_size,
            eager_reclaim_threshold,
            stats: spin::Mutex::new(MergeStats::default()),
        }
    }

    pub fn stats(&self) -> MergeStats {
        self.stats.lock().clone()
    }

    fn is_humongous_reclaim_candidate(&self, region_idx: u32) -> bool {
        let region = self.heap.region(region_idx);
        region.kind() == crate::heap::RegionKind::HumongousStart
            && region.rem_set().is_complete()
            && region
                .rem_set()
                .occupancy_less_or_equal_to(self.eager_reclaim_threshold)
    }

    /// Flush the remembered sets of humongous eager-reclaim candidates
    /// onto the card table, then drop them; entries keep accumulating for
    /// candidates that end up not reclaimed.
    fn flush_humongous_candidate_remsets(&self, merge: &mut MergeCardSetClosure) {
        for region in self.heap.regions() {
            let region_idx = region.index();
            if !self.is_humongous_reclaim_candidate(region_idx) {
                continue;
            }
            debug_assert!(region.rem_set().is_complete());
            if !region.rem_set().is_empty() {
                region.rem_set().iterate_for_merge(merge);
                merge.flush();
                // Only the card-based set is dropped: nothing rebuilds it
                // implicitly during eager reclaim, and the region must
                // stay tracked in case it survives this pause.
                region.rem_set().clear(true, true);
            }
            debug_assert!(region.rem_set().is_empty());
        }
    }
}

impl WorkerTask for MergeHeapRootsTask<'_> {
    fn name(&self) -> &'static str {
        "merge heap roots"
    }

    fn work(&self, _worker_id: usize) {
        let mut merge =
            MergeCardSetClosure::new(self.heap, self.scan_state, self.prefetch_cache_size);

        // 1. Eager-reclaim candidates; a single winner handles all of
        // them.
        if self.initial_evacuation
            && !self.fast_reclaim_handled.load(Ordering::Relaxed)
            && self
                .fast_reclaim_handled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.flush_humongous_candidate_remsets(&mut merge);
        }

        // 2. Collection set regions, claimed one at a time.
        loop {
            let claim = self.cset_claim.fetch_add(1, Ordering::Relaxed);
            if claim >= self.cset_regions.len() {
                break;
            }
            let region = self.heap.region(self.cset_regions[claim]);
            region.rem_set().iterate_for_merge(&mut merge);
        }

        // 3. Preparation for evacuation failure handling.
        loop {
            let claim = self.evac_prepare_claim.fetch_add(1, Ordering::Relaxed);
            if claim >= self.cset_regions.len() {
                break;
            }
            let region_idx = self.cset_regions[claim];
            // After the initial evacuation the refinement table of newly
            // added (optional) collection set regions still holds marks
            // for old-to-collection-set candidates; evacuating the region
            // invalidates them.
            if !self.initial_evacuation {
                self.heap.clear_refinement_table_for_region(region_idx);
            } else {
                #[cfg(feature = "extreme_assertions")]
                {
                    let base = self.heap.geometry().region_card_base(region_idx);
                    let cards = self.heap.geometry().cards_per_region() as usize;
                    assert!(
                        self.heap.refinement_table().is_range_clean(base, base + cards),
                        "refinement table of region {region_idx} not clean"
                    );
                }
            }
            self.scan_state.add_all_dirty_region(region_idx);
        }

        self.stats.lock().add(&merge.into_stats());
    }
}
