//! Per-region card claim counters.
//!
//! Both the concurrent sweep and the STW card scan distribute work by
//! atomically claiming fixed-size chunks of cards per region. A region with
//! its counter at or past the cards-per-region limit has nothing left to
//! claim; saturating the counter is how regions are excluded (free regions
//! at snapshot time, regions reclaimed mid-sweep).

use std::sync::atomic::{AtomicU32, Ordering};

/// One atomic claim counter per region, counting cards already handed out.
pub struct ClaimTable {
    cards_per_region: u32,
    cards_per_chunk: u32,
    claims: Box<[AtomicU32]>,
}

impl ClaimTable {
    pub fn new(max_regions: usize, cards_per_region: u32, chunks_per_region: u32) -> Self {
        assert!(chunks_per_region > 0, "{chunks_per_region} chunks per region");
        assert!(
            cards_per_region % chunks_per_region == 0,
            "chunks must evenly divide a region"
        );
        let claims = (0..max_regions).map(|_| AtomicU32::new(0)).collect();
        ClaimTable {
            cards_per_region,
            cards_per_chunk: cards_per_region / chunks_per_region,
            claims,
        }
    }

    pub fn max_regions(&self) -> usize {
        self.claims.len()
    }

    pub fn cards_per_chunk(&self) -> u32 {
        self.cards_per_chunk
    }

    pub fn reset_all_to_unclaimed(&self) {
        for claim in self.claims.iter() {
            claim.store(0, Ordering::Relaxed);
        }
    }

    pub fn reset_all_to_claimed(&self) {
        for claim in self.claims.iter() {
            claim.store(self.cards_per_region, Ordering::Relaxed);
        }
    }

    pub fn reset_to_unclaimed(&self, region: usize) {
        self.claims[region].store(0, Ordering::Relaxed);
    }

    pub fn has_unclaimed_cards(&self, region: usize) -> bool {
        self.claims[region].load(Ordering::Relaxed) < self.cards_per_region
    }

    /// Claim the next chunk of `region`, returning the first card index of
    /// the claim (possibly past the end).
    pub fn claim_chunk(&self, region: usize) -> u32 {
        self.claims[region].fetch_add(self.cards_per_chunk, Ordering::Relaxed)
    }

    /// Claim every card of `region` at once. Returns the previous claim.
    pub fn claim_all_cards(&self, region: usize) -> u32 {
        self.claims[region].fetch_add(self.cards_per_region, Ordering::Relaxed)
    }

    /// Visit regions with unclaimed cards, starting each worker at a
    /// different offset so workers spread over the region space. Every
    /// worker looks at all regions, skipping completed ones; `visit`
    /// returning true aborts the iteration (the task yielded).
    pub fn iterate_from_worker_offset(
        &self,
        worker_id: usize,
        max_workers: usize,
        mut visit: impl FnMut(usize) -> bool,
    ) {
        let num_regions = self.claims.len();
        let start_index = worker_id * num_regions / max_workers.max(1);
        for count in 0..num_regions {
            let index = (start_index + count) % num_regions;
            if !self.has_unclaimed_cards(index) {
                continue;
            }
            if visit(index) {
                return;
            }
        }
    }
}

/// Claims successive chunks of one region from a [`ClaimTable`].
pub struct ChunkClaimer<'a> {
    claims: &'a ClaimTable,
    region: usize,
    current: u32,
}

impl<'a> ChunkClaimer<'a> {
    pub fn new(claims: &'a ClaimTable, region: usize) -> Self {
        ChunkClaimer {
            claims,
            region,
            current: 0,
        }
    }

    pub fn has_next(&mut self) -> bool {
        self.current = self.claims.claim_chunk(self.region);
        self.current < self.claims.cards_per_region
    }

    /// First card (within the region) of the current claim.
    pub fn value(&self) -> u32 {
        self.current
    }

    /// Number of cards per claim.
    pub fn size(&self) -> u32 {
        self.claims.cards_per_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_region_exactly_once() {
        let table = ClaimTable::new(4, 256, 8);
        let mut claimer = ChunkClaimer::new(&table, 2);
        let mut claimed = Vec::new();
        while claimer.has_next() {
            claimed.push(claimer.value());
        }
        assert_eq!(claimed, (0..8).map(|i| i * 32).collect::<Vec<_>>());
        assert!(!table.has_unclaimed_cards(2));
        assert!(table.has_unclaimed_cards(1));
    }

    #[test]
    fn claim_all_excludes_region() {
        let table = ClaimTable::new(2, 256, 8);
        assert_eq!(table.claim_all_cards(0), 0);
        assert!(!table.has_unclaimed_cards(0));
        // A racing chunk claimer gets nothing.
        let mut claimer = ChunkClaimer::new(&table, 0);
        assert!(!claimer.has_next());
    }

    #[test]
    fn worker_offset_iteration_skips_claimed() {
        let table = ClaimTable::new(8, 256, 8);
        table.claim_all_cards(0);
        table.claim_all_cards(5);
        let mut seen = Vec::new();
        table.iterate_from_worker_offset(1, 2, |region| {
            seen.push(region);
            false
        });
        assert_eq!(seen, vec![4, 6, 7, 1, 2, 3]);
    }

    #[test]
    fn concurrent_claims_are_disjoint() {
        let table = ClaimTable::new(1, 2048, 64);
        let claimed: Vec<Vec<u32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut mine = Vec::new();
                        let mut claimer = ChunkClaimer::new(&table, 0);
                        while claimer.has_next() {
                            mine.push(claimer.value());
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut all: Vec<u32> = claimed.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..64).map(|i| i * 32).collect::<Vec<_>>());
    }
}
