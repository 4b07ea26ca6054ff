//! Per-pause heap-root scan state.
//!
//! Tracks, across the (possibly several) evacuation increments of one
//! pause: which cards of which regions are claimable for scanning, which
//! regions' card tables were scribbled on (and so need clearing at pause
//! end), which regions need scanning in the current increment, and the
//! address up to which scanning each region is valid.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::heap::{ChunkClaimer, ClaimTable, Heap};
use crate::scheduler::WorkerTask;
use crate::util::Address;

/// A bag of unique region indices supporting concurrent idempotent adds
/// and ordered iteration from a per-worker start offset.
pub struct DirtyRegions {
    buffer: Box<[AtomicU32]>,
    cur_idx: AtomicUsize,
    contains: Box<[AtomicBool]>,
}

impl DirtyRegions {
    pub fn new(max_regions: usize) -> DirtyRegions {
        DirtyRegions {
            buffer: (0..max_regions).map(|_| AtomicU32::new(0)).collect(),
            cur_idx: AtomicUsize::new(0),
            contains: (0..max_regions).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn reset(&self) {
        self.cur_idx.store(0, Ordering::Relaxed);
        for flag in self.contains.iter() {
            flag.store(false, Ordering::Relaxed);
        }
    }

    pub fn size(&self) -> usize {
        self.cur_idx.load(Ordering::Relaxed)
    }

    pub fn at(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.size());
        self.buffer[idx].load(Ordering::Relaxed)
    }

    /// Add a region; concurrent duplicate adds insert once.
    pub fn add_dirty_region(&self, region: u32) {
        if self.contains[region as usize].load(Ordering::Relaxed) {
            return;
        }
        if self.contains[region as usize]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let slot = self.cur_idx.fetch_add(1, Ordering::Relaxed);
            self.buffer[slot].store(region, Ordering::Relaxed);
        }
    }

    /// Union `other` into this bag. Not thread safe; used between
    /// evacuation increments.
    pub fn merge(&self, other: &DirtyRegions) {
        for idx in 0..other.size() {
            let region = other.at(idx);
            if !self.contains[region as usize].load(Ordering::Relaxed) {
                let slot = self.cur_idx.load(Ordering::Relaxed);
                self.buffer[slot].store(region, Ordering::Relaxed);
                self.cur_idx.store(slot + 1, Ordering::Relaxed);
                self.contains[region as usize].store(true, Ordering::Relaxed);
            }
        }
    }
}

pub struct ScanState {
    /// Claim counters over the primary card table, used by scan workers.
    card_claim_table: ClaimTable,
    /// Regions whose card table was scribbled on during this pause; their
    /// card table ranges are cleared at pause end.
    all_dirty_regions: DirtyRegions,
    /// Regions to scan in the current evacuation increment.
    next_dirty_regions: DirtyRegions,
    /// Per region, the address up to which scanning is valid this pause.
    /// Zero means "do not scan" (collection set, young, free regions).
    scan_top: Box<[AtomicUsize]>,
}

impl ScanState {
    pub fn new(heap: &Heap) -> ScanState {
        let geometry = heap.geometry();
        ScanState {
            card_claim_table: ClaimTable::new(
                geometry.num_regions(),
                geometry.cards_per_region(),
                geometry.chunks_per_region(),
            ),
            all_dirty_regions: DirtyRegions::new(geometry.num_regions()),
            next_dirty_regions: DirtyRegions::new(geometry.num_regions()),
            scan_top: (0..geometry.num_regions()).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Pause-entry reset: clear every scan top and empty both dirty bags.
    /// Values must be valid for regions that only become used during the
    /// pause, hence all of them are reset.
    pub fn prepare(&self) {
        for top in self.scan_top.iter() {
            top.store(0, Ordering::Relaxed);
        }
        self.all_dirty_regions.reset();
        self.next_dirty_regions.reset();
    }

    /// Before each merge phase the claims start over; the `scanned` card
    /// marks are what prevents double scanning across increments.
    pub fn prepare_for_merge_heap_roots(&self) {
        self.card_claim_table.reset_all_to_unclaimed();
    }

    /// Finish one evacuation increment. `merge_dirty_regions` is set when
    /// the pause runs more than one increment: scanned-card marks then
    /// survive in the card table and the scanned regions must be
    /// remembered for the final clear.
    pub fn complete_evac_phase(&self, merge_dirty_regions: bool) {
        if merge_dirty_regions {
            self.all_dirty_regions.merge(&self.next_dirty_regions);
        }
        self.next_dirty_regions.reset();
    }

    /// Whether remembered set entries pointing at `region_idx` are worth
    /// scanning. Remembered sets are not cleaned up before merging, so
    /// they may name collection set regions, free regions, etc.
    pub fn contains_cards_to_process(&self, heap: &Heap, region_idx: u32) -> bool {
        let region = heap.region(region_idx);
        !region.in_collection_set() && region.is_old_or_humongous()
    }

    pub fn add_dirty_region(&self, region: u32) {
        self.next_dirty_regions.add_dirty_region(region);
    }

    pub fn add_all_dirty_region(&self, region: u32) {
        self.all_dirty_regions.add_dirty_region(region);
    }

    pub fn num_cards_in_dirty_regions(&self, heap: &Heap) -> usize {
        self.next_dirty_regions.size() * heap.geometry().cards_per_region() as usize
    }

    pub fn set_scan_top(&self, region_idx: u32, value: Address) {
        self.scan_top[region_idx as usize].store(value.as_usize(), Ordering::Relaxed);
    }

    pub fn scan_top(&self, region_idx: u32) -> Option<Address> {
        match self.scan_top[region_idx as usize].load(Ordering::Relaxed) {
            0 => None,
            raw => Some(Address::from_usize(raw)),
        }
    }

    pub fn clear_scan_top(&self, region_idx: u32) {
        self.scan_top[region_idx as usize].store(0, Ordering::Relaxed);
    }

    pub fn has_cards_to_scan(&self, region_idx: u32) -> bool {
        self.card_claim_table.has_unclaimed_cards(region_idx as usize)
    }

    pub fn claimer(&self, region_idx: u32) -> ChunkClaimer<'_> {
        ChunkClaimer::new(&self.card_claim_table, region_idx as usize)
    }

    /// Iterate the current increment's dirty regions. Work distribution is
    /// by worker start offset: every worker walks the whole list, skipping
    /// regions without claimable cards inside `f`.
    pub fn iterate_dirty_regions_from(
        &self,
        worker_id: usize,
        max_workers: usize,
        mut f: impl FnMut(u32),
    ) {
        let num_regions = self.next_dirty_regions.size();
        if num_regions == 0 {
            return;
        }
        let start_pos = num_regions * worker_id / max_workers.max(1);
        let mut cur = start_pos;
        loop {
            f(self.next_dirty_regions.at(cur));
            cur += 1;
            if cur == num_regions {
                cur = 0;
            }
            if cur == start_pos {
                break;
            }
        }
    }

    pub fn all_dirty_regions(&self) -> &DirtyRegions {
        &self.all_dirty_regions
    }
}

/// Pause-end cleanup: reset every scribbled card table range to clean.
pub struct ClearCardTableTask<'a> {
    heap: &'a Heap,
    scan_state: &'a ScanState,
    cur_dirty_region: AtomicUsize,
}

impl<'a> ClearCardTableTask<'a> {
    /// Aim for roughly a megabyte of card table per worker claim.
    const NUM_CARDS_PER_WORKER: usize = 1 << 20;

    pub fn new(heap: &'a Heap, scan_state: &'a ScanState) -> ClearCardTableTask<'a> {
        ClearCardTableTask {
            heap,
            scan_state,
            cur_dirty_region: AtomicUsize::new(0),
        }
    }
}

impl WorkerTask for ClearCardTableTask<'_> {
    fn name(&self) -> &'static str {
        "clear card table"
    }

    fn work(&self, _worker_id: usize) {
        let regions = self.scan_state.all_dirty_regions();
        let cards_per_region = self.heap.geometry().cards_per_region() as usize;
        let regions_per_claim = (Self::NUM_CARDS_PER_WORKER / cards_per_region).max(1);

        loop {
            let next = self.cur_dirty_region.fetch_add(regions_per_claim, Ordering::Relaxed);
            if next >= regions.size() {
                return;
            }
            let max = (next + regions_per_claim).min(regions.size());
            for idx in next..max {
                // Humongous eager-reclaim candidates are not in this set;
                // their tables are cleared by the reclaim path itself.
                self.heap.clear_card_table_for_region(regions.at(idx));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_regions_unique_adds() {
        let bag = DirtyRegions::new(16);
        bag.add_dirty_region(3);
        bag.add_dirty_region(7);
        bag.add_dirty_region(3);
        assert_eq!(bag.size(), 2);
        assert_eq!((bag.at(0), bag.at(1)), (3, 7));
    }

    #[test]
    fn dirty_regions_concurrent_adds() {
        let bag = DirtyRegions::new(64);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for region in 0..64u32 {
                        bag.add_dirty_region(region);
                    }
                });
            }
        });
        assert_eq!(bag.size(), 64);
        let mut seen: Vec<u32> = (0..64).map(|i| bag.at(i)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn merge_unions_bags() {
        let all = DirtyRegions::new(16);
        let next = DirtyRegions::new(16);
        all.add_dirty_region(1);
        next.add_dirty_region(1);
        next.add_dirty_region(2);
        all.merge(&next);
        assert_eq!(all.size(), 2);
    }
}
