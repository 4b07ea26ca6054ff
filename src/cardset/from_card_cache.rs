//! Per-worker from-card cache.
//!
//! A direct-mapped cache of the last card each worker inserted per target
//! region. Refinement repeatedly finds references from the same source
//! card into the same region; consulting this cache first avoids redundant
//! CAS traffic on hot containers. Entries are invalidated per region when
//! that region's remembered set is cleared or changes state.

use std::sync::atomic::AtomicUsize;

use atomic::Ordering;

const INVALID_CARD: usize = usize::MAX;

pub struct FromCardCache {
    max_regions: usize,
    /// `num_workers * max_regions` entries, worker-major.
    entries: Box<[AtomicUsize]>,
}

impl FromCardCache {
    pub fn new(num_workers: usize, max_regions: usize) -> FromCardCache {
        let entries = (0..num_workers * max_regions)
            .map(|_| AtomicUsize::new(INVALID_CARD))
            .collect();
        FromCardCache {
            max_regions,
            entries,
        }
    }

    fn entry(&self, worker: usize, region: u32) -> &AtomicUsize {
        &self.entries[worker * self.max_regions + region as usize]
    }

    /// Returns true if `card` was the last card this worker added towards
    /// `region`; otherwise remembers it and returns false.
    pub fn contains_or_replace(&self, worker: usize, region: u32, card: usize) -> bool {
        let entry = self.entry(worker, region);
        if entry.load(Ordering::Relaxed) == card {
            return true;
        }
        entry.store(card, Ordering::Relaxed);
        false
    }

    /// Invalidate every worker's entry for `region`.
    pub fn clear_region(&self, region: u32) {
        let num_workers = self.entries.len() / self.max_regions;
        for worker in 0..num_workers {
            self.entry(worker, region).store(INVALID_CARD, Ordering::Relaxed);
        }
    }
}
