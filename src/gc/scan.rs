//! Phase 3: parallel scan of the merged card table.
//!
//! Workers walk the current increment's dirty regions from per-worker
//! offsets, claim card chunks, find runs of to-scan cards, flip them to
//! `scanned` (or clean, in the last increment) and walk the covered heap
//! ranges looking for references into the collection set.

use std::time::Instant;

use crate::heap::card_table::{CardValue, ChunkScanner};
use crate::heap::Heap;
use crate::scheduler::WorkerTask;
use crate::util::constants::LOG_BYTES_IN_CARD;
use crate::util::{Address, MemRegion};

use super::scan_state::ScanState;

/// Receives the collection set roots the scan discovers. The embedding
/// collector's evacuation machinery implements this to enqueue objects for
/// copying.
pub trait EvacuationSink: Sync {
    fn do_root(&self, worker_id: usize, slot: Address, target: Address);
}

/// Per-worker scan statistics.
#[derive(Default, Clone)]
pub struct ScanStats {
    /// Cards that were mutator-dirtied (as opposed to remset-merged).
    pub cards_pending: usize,
    /// Cards scanned that produced no collection set roots.
    pub cards_empty: usize,
    pub cards_scanned: usize,
    pub blocks_scanned: usize,
    pub chunks_claimed: usize,
    pub heap_roots_found: usize,
    pub scan_duration: std::time::Duration,
}

impl ScanStats {
    pub fn add(&mut self, other: &ScanStats) {
        self.cards_pending += other.cards_pending;
        self.cards_empty += other.cards_empty;
        self.cards_scanned += other.cards_scanned;
        self.blocks_scanned += other.blocks_scanned;
        self.chunks_claimed += other.chunks_claimed;
        self.heap_roots_found += other.heap_roots_found;
        self.scan_duration += other.scan_duration;
    }
}

pub struct ScanHeapRootsTask<'a> {
    heap: &'a Heap,
    scan_state: &'a ScanState,
    sink: &'a dyn EvacuationSink,
    max_workers: usize,
    /// What scanned cards are rewritten to: `scanned` when further
    /// evacuation increments may follow (so they skip these cards), clean
    /// otherwise.
    scanned_card_value: CardValue,
    stats: spin::Mutex<ScanStats>,
}

struct WorkerScan<'a, 'b> {
    task: &'b ScanHeapRootsTask<'a>,
    worker_id: usize,
    /// Heap address this worker has already walked up to in the current
    /// region (exclusive). Objects spanning cards are not re-walked.
    scanned_to: Option<Address>,
    stats: ScanStats,
}

impl<'a> ScanHeapRootsTask<'a> {
    pub fn new(
        heap: &'a Heap,
        scan_state: &'a ScanState,
        sink: &'a dyn EvacuationSink,
        max_workers: usize,
        remember_already_scanned_cards: bool,
    ) -> ScanHeapRootsTask<'a> {
        ScanHeapRootsTask {
            heap,
            scan_state,
            sink,
            max_workers,
            scanned_card_value: if remember_already_scanned_cards {
                crate::heap::card_table::SCANNED_CARD
            } else {
                crate::heap::card_table::CLEAN_CARD
            },
            stats: spin::Mutex::new(ScanStats::default()),
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.lock().clone()
    }
}

impl WorkerScan<'_, '_> {
    fn scan_mem_region(&mut self, region_idx: u32, mr: MemRegion) -> (Address, usize) {
        let task = self.task;
        let mut roots_found = 0;
        let scanned_to = task.heap.object_scanner().scan_range(
            region_idx,
            mr,
            &mut |slot, target| {
                if task.heap.region_containing(target).in_collection_set() {
                    task.sink.do_root(self.worker_id, slot, target);
                    roots_found += 1;
                }
            },
        );
        // Phase 3 only queues regions with a stable top, so parse failures
        // indicate corruption.
        let scanned_to = scanned_to.expect("unparsable card during heap root scan");
        debug_assert!(scanned_to >= mr.end());
        (scanned_to, roots_found)
    }

    fn do_claimed_block(&mut self, region_idx: u32, dirty_l: usize, dirty_r: usize) {
        let task = self.task;
        let ct = task.heap.card_table();

        self.stats.cards_pending += ct.change_dirty_cards_to(dirty_l, dirty_r, task.scanned_card_value);
        let num_cards = dirty_r - dirty_l;
        self.stats.blocks_scanned += 1;

        let card_start = ct.addr_for(dirty_l);
        let Some(top) = task.scan_state.scan_top(region_idx) else {
            return;
        };
        if card_start >= top {
            return;
        }

        let scan_end = std::cmp::min(card_start + (num_cards << LOG_BYTES_IN_CARD), top);
        if let Some(scanned_to) = self.scanned_to {
            if scanned_to >= scan_end {
                return;
            }
        }
        let start = match self.scanned_to {
            Some(scanned_to) => std::cmp::max(card_start, scanned_to),
            None => card_start,
        };
        let (scanned_to, roots_found) = self.scan_mem_region(region_idx, MemRegion::new(start, scan_end));
        self.scanned_to = Some(scanned_to);

        if roots_found == 0 {
            self.stats.cards_empty += num_cards;
        }
        self.stats.cards_scanned += num_cards;
        self.stats.heap_roots_found += roots_found;
    }

    fn scan_region(&mut self, region_idx: u32) {
        let task = self.task;
        if !task.scan_state.has_cards_to_scan(region_idx) {
            return;
        }

        // Reset the scan finger for this region. Claims grow
        // monotonically, so the finger also filters objects spanning
        // chunks within the region.
        self.scanned_to = None;

        let ct = task.heap.card_table();
        let region_card_base = task.heap.geometry().region_card_base(region_idx);

        let mut claimer = task.scan_state.claimer(region_idx);
        while claimer.has_next() {
            self.stats.chunks_claimed += 1;
            let start = region_card_base + claimer.value() as usize;
            let end = start + claimer.size() as usize;
            ChunkScanner::new(ct, start, end).on_to_scan_cards(|dirty_l, dirty_r| {
                self.do_claimed_block(region_idx, dirty_l, dirty_r);
            });
        }
    }
}

impl WorkerTask for ScanHeapRootsTask<'_> {
    fn name(&self) -> &'static str {
        "scan heap roots"
    }

    fn work(&self, worker_id: usize) {
        let start = Instant::now();
        let mut scan = WorkerScan {
            task: self,
            worker_id,
            scanned_to: None,
            stats: ScanStats::default(),
        };

        self.scan_state
            .iterate_dirty_regions_from(worker_id, self.max_workers, |region_idx| {
                scan.scan_region(region_idx);
            });

        scan.stats.scan_duration = start.elapsed();
        trace!(
            "scan heap roots worker {}: pending {} scanned {} empty {} blocks {} chunks {} roots {}",
            worker_id,
            scan.stats.cards_pending,
            scan.stats.cards_scanned,
            scan.stats.cards_empty,
            scan.stats.blocks_scanned,
            scan.stats.chunks_claimed,
            scan.stats.heap_roots_found
        );
        self.stats.lock().add(&scan.stats);
    }
}
