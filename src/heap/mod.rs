//! The region-partitioned heap model: region array, the twin card tables
//! and the global table-role swap.

pub mod card_table;
pub mod claim_table;
mod region;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cardset::config::CardSetConfig;
use crate::cardset::from_card_cache::FromCardCache;
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::{Address, MemRegion};
use crate::vm::{MutatorRegistry, MutatorThread, YieldFlag};

pub use card_table::CardTable;
pub use claim_table::{ChunkClaimer, ClaimTable};
pub use region::{Region, RegionKind};

/// Object parsing and reference iteration, provided by the embedding
/// collector.
pub trait ObjectScanner: Send + Sync {
    /// Iterate the references of all objects intersecting `mr` within
    /// region `region_idx`, invoking `f(slot, target)` for each reference.
    /// Returns the address the walk advanced to (at least `mr.end()`), or
    /// `None` when an object could not be parsed (e.g. a stale card over a
    /// partially initialized object).
    fn scan_range(
        &self,
        region_idx: u32,
        mr: MemRegion,
        f: &mut dyn FnMut(Address, Address),
    ) -> Option<Address>;
}

/// Heap sizing derived at startup.
pub struct HeapGeometry {
    heap_base: Address,
    region_bytes: usize,
    log_region_bytes: u32,
    num_regions: usize,
    cards_per_region: u32,
    log_cards_per_region: u32,
}

impl HeapGeometry {
    /// Pick the region size: forced by the option when non-zero, otherwise
    /// aimed at [`TARGET_REGION_NUMBER`] regions; either way a power of two
    /// clamped to the supported range.
    fn region_size(heap_bytes: usize, options: &Options) -> usize {
        let forced = *options.heap_region_size;
        let size = if forced != 0 {
            forced
        } else {
            let average = heap_bytes / TARGET_REGION_NUMBER;
            if average == 0 {
                MIN_REGION_SIZE
            } else {
                1usize << average.ilog2()
            }
        };
        size.clamp(MIN_REGION_SIZE, MAX_REGION_SIZE)
    }

    pub fn new(heap_base: Address, heap_bytes: usize, options: &Options) -> Result<HeapGeometry, String> {
        let region_bytes = Self::region_size(heap_bytes, options);
        if heap_bytes == 0 || heap_bytes % region_bytes != 0 {
            return Err(format!(
                "heap size {heap_bytes} is not a multiple of the region size {region_bytes}"
            ));
        }
        if !heap_base.is_aligned_to(region_bytes) {
            return Err(format!("heap base {heap_base} not aligned to region size"));
        }
        let log_region_bytes = region_bytes.ilog2();
        let log_cards_per_region = log_region_bytes - LOG_BYTES_IN_CARD as u32;
        Ok(HeapGeometry {
            heap_base,
            region_bytes,
            log_region_bytes,
            num_regions: heap_bytes / region_bytes,
            cards_per_region: 1 << log_cards_per_region,
            log_cards_per_region,
        })
    }

    pub fn heap_base(&self) -> Address {
        self.heap_base
    }

    pub fn region_bytes(&self) -> usize {
        self.region_bytes
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn cards_per_region(&self) -> u32 {
        self.cards_per_region
    }

    pub fn log_cards_per_region(&self) -> u32 {
        self.log_cards_per_region
    }

    pub fn total_cards(&self) -> usize {
        self.num_regions << self.log_cards_per_region
    }

    pub fn region_index_for(&self, addr: Address) -> u32 {
        debug_assert!(addr >= self.heap_base);
        let index = (addr - self.heap_base) >> self.log_region_bytes;
        debug_assert!(index < self.num_regions, "address {addr} outside the heap");
        index as u32
    }

    pub fn region_base(&self, index: u32) -> Address {
        self.heap_base + ((index as usize) << self.log_region_bytes)
    }

    /// First card index of a region.
    pub fn region_card_base(&self, index: u32) -> usize {
        (index as usize) << self.log_cards_per_region
    }

    /// Work distribution granularity: cards are claimed in chunks, sized so
    /// larger regions split into more chunks.
    pub fn chunks_per_region(&self) -> u32 {
        1 << (self.log_region_bytes / 2 - 4).min(self.log_cards_per_region)
    }
}

/// The heap: regions, twin card tables, mutator registry and the global
/// state the remembered set machinery hangs off.
pub struct Heap {
    geometry: HeapGeometry,
    config: Arc<CardSetConfig>,
    regions: Box<[Region]>,
    tables: [Box<CardTable>; 2],
    /// Index of the table currently acting as the card table (the one
    /// mutator barriers dirty); the other is the refinement table.
    card_table_idx: AtomicUsize,
    mutators: MutatorRegistry,
    yield_flag: YieldFlag,
    from_card_cache: Arc<FromCardCache>,
    scanner: Box<dyn ObjectScanner>,
}

impl Heap {
    pub fn new(
        heap_base: Address,
        heap_bytes: usize,
        options: &Options,
        scanner: Box<dyn ObjectScanner>,
    ) -> Result<Heap, String> {
        crate::util::logger::try_init();

        let geometry = HeapGeometry::new(heap_base, heap_bytes, options)?;
        let config = Arc::new(CardSetConfig::new(
            geometry.log_cards_per_region(),
            *options.rem_set_array_of_cards_entries as u32,
            *options.rem_set_coarsen_howl_bitmap_to_howl_full_percent as u32,
            *options.rem_set_howl_num_buckets as u32,
            *options.rem_set_coarsen_howl_to_full_percent as u32,
        ));
        config.check_heap_representable(heap_bytes)?;

        let num_workers = *options.parallel_gc_threads + *options.conc_refinement_threads + 1;
        let from_card_cache = Arc::new(FromCardCache::new(num_workers, geometry.num_regions()));

        let regions = (0..geometry.num_regions() as u32)
            .map(|index| {
                Region::new(
                    index,
                    geometry.region_base(index),
                    geometry.region_base(index) + geometry.region_bytes(),
                    config.clone(),
                    from_card_cache.clone(),
                    heap_base,
                )
            })
            .collect();

        let total_cards = geometry.total_cards();
        let tables = [
            Box::new(CardTable::new(heap_base, total_cards)),
            Box::new(CardTable::new(heap_base, total_cards)),
        ];

        info!(
            "heap: {} regions of {}K ({} cards each)",
            geometry.num_regions(),
            geometry.region_bytes() / BYTES_IN_KBYTE,
            geometry.cards_per_region()
        );

        Ok(Heap {
            geometry,
            config,
            regions,
            tables,
            card_table_idx: AtomicUsize::new(0),
            mutators: MutatorRegistry::new(),
            yield_flag: YieldFlag::new(),
            from_card_cache,
            scanner,
        })
    }

    pub fn geometry(&self) -> &HeapGeometry {
        &self.geometry
    }

    pub fn card_set_config(&self) -> &Arc<CardSetConfig> {
        &self.config
    }

    pub fn num_regions(&self) -> usize {
        self.geometry.num_regions()
    }

    pub fn region(&self, index: u32) -> &Region {
        &self.regions[index as usize]
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn region_containing(&self, addr: Address) -> &Region {
        self.region(self.geometry.region_index_for(addr))
    }

    pub fn from_card_cache(&self) -> &Arc<FromCardCache> {
        &self.from_card_cache
    }

    pub fn object_scanner(&self) -> &dyn ObjectScanner {
        self.scanner.as_ref()
    }

    pub fn yield_flag(&self) -> &YieldFlag {
        &self.yield_flag
    }

    pub fn mutators(&self) -> &MutatorRegistry {
        &self.mutators
    }

    // --- Card tables ------------------------------------------------------

    /// The table mutator barriers currently dirty and STW scanning
    /// consults.
    pub fn card_table(&self) -> &CardTable {
        &self.tables[self.card_table_idx.load(Ordering::Acquire)]
    }

    /// The shadow table concurrent refinement drains.
    pub fn refinement_table(&self) -> &CardTable {
        &self.tables[1 - self.card_table_idx.load(Ordering::Acquire)]
    }

    /// Swap the global table roles. Takes the thread-list lock so no new
    /// mutator can register and cache a stale base pointer mid-swap.
    pub fn swap_global_card_table(&self) {
        self.mutators.with_threads_locked(|| {
            self.card_table_idx.fetch_xor(1, Ordering::SeqCst);
        });
    }

    /// Register a mutator thread, its barrier aimed at the current card
    /// table.
    pub fn register_mutator(&self) -> std::sync::Arc<MutatorThread> {
        self.mutators.register(|| self.card_table())
    }

    /// Handshake every mutator onto the current card table.
    pub fn handshake_mutator_card_tables(&self) {
        self.mutators.handshake_swap_card_table(self.card_table());
    }

    // --- Per-region card ranges -------------------------------------------

    pub fn clear_card_table_for_region(&self, index: u32) {
        let base = self.geometry.region_card_base(index);
        self.card_table()
            .clear_range(base, base + self.geometry.cards_per_region() as usize);
    }

    pub fn clear_refinement_table_for_region(&self, index: u32) {
        let base = self.geometry.region_card_base(index);
        self.refinement_table()
            .clear_range(base, base + self.geometry.cards_per_region() as usize);
    }

    // --- Region lifecycle hooks -------------------------------------------

    /// Take a region into use. Tracking starts immediately with a
    /// complete (empty) remembered set.
    pub fn allocate_region(&self, index: u32, kind: RegionKind) {
        let region = self.region(index);
        debug_assert!(region.is_free(), "region {index} already in use");
        region.set_kind(kind);
        region.set_top(region.bottom());
        if kind != RegionKind::Free {
            region.rem_set().set_state_complete();
        }
    }

    /// Return a region to the free list, dropping its remembered set.
    pub fn free_region(&self, index: u32) {
        let region = self.region(index);
        region.rem_set().clear(false, false);
        region.set_in_collection_set(false);
        region.clear_index_in_opt_cset();
        region.set_kind(RegionKind::Free);
        region.set_top(region.bottom());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// Heap base used by unit tests.
    pub const TEST_HEAP_BASE: usize = 0x4000_0000;

    /// A scanner backed by an explicit map from card index to the
    /// references (slot, target) located on that card. Cards marked
    /// unparsable make `scan_range` fail.
    #[derive(Default)]
    pub struct MapScanner {
        refs_by_card: spin::Mutex<HashMap<usize, Vec<(Address, Address)>>>,
        unparsable_cards: spin::Mutex<std::collections::HashSet<usize>>,
    }

    impl MapScanner {
        pub fn add_ref(&self, slot: Address, target: Address) {
            let card = (slot.as_usize() - TEST_HEAP_BASE) >> LOG_BYTES_IN_CARD;
            self.refs_by_card.lock().entry(card).or_default().push((slot, target));
        }

        pub fn set_unparsable(&self, card: usize, unparsable: bool) {
            let mut cards = self.unparsable_cards.lock();
            if unparsable {
                cards.insert(card);
            } else {
                cards.remove(&card);
            }
        }
    }

    impl ObjectScanner for MapScanner {
        fn scan_range(
            &self,
            _region_idx: u32,
            mr: MemRegion,
            f: &mut dyn FnMut(Address, Address),
        ) -> Option<Address> {
            let first_card = (mr.start().as_usize() - TEST_HEAP_BASE) >> LOG_BYTES_IN_CARD;
            let last_card = (mr.end().as_usize() - TEST_HEAP_BASE - 1) >> LOG_BYTES_IN_CARD;
            let unparsable = self.unparsable_cards.lock();
            let refs = self.refs_by_card.lock();
            for card in first_card..=last_card {
                if unparsable.contains(&card) {
                    return None;
                }
            }
            for card in first_card..=last_card {
                if let Some(slots) = refs.get(&card) {
                    for (slot, target) in slots {
                        if mr.contains(*slot) {
                            f(*slot, *target);
                        }
                    }
                }
            }
            Some(mr.end())
        }
    }

    /// A small 32-region heap with 1M regions for pipeline tests.
    pub fn test_heap_with_scanner() -> (Heap, std::sync::Arc<MapScanner>) {
        // The scanner is shared: the heap owns a boxed handle, tests keep
        // another for seeding references.
        struct Shared(std::sync::Arc<MapScanner>);
        impl ObjectScanner for Shared {
            fn scan_range(
                &self,
                region_idx: u32,
                mr: MemRegion,
                f: &mut dyn FnMut(Address, Address),
            ) -> Option<Address> {
                self.0.scan_range(region_idx, mr, f)
            }
        }

        let scanner = std::sync::Arc::new(MapScanner::default());
        let mut options = Options::new();
        options.set_from_str("heap_region_size", &MIN_REGION_SIZE.to_string());
        options.set_from_str("parallel_gc_threads", "4");
        options.set_from_str("conc_refinement_threads", "2");
        let heap = Heap::new(
            Address::from_usize(TEST_HEAP_BASE),
            32 * MIN_REGION_SIZE,
            &options,
            Box::new(Shared(scanner.clone())),
        )
        .unwrap();
        (heap, scanner)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    #[test]
    fn geometry_derivation() {
        let options = Options::new();
        let geometry = HeapGeometry::new(
            Address::from_usize(TEST_HEAP_BASE),
            256 * BYTES_IN_MBYTE,
            &options,
        )
        .unwrap();
        // 256M / 2048 target regions = 128K average, clamped up to 1M.
        assert_eq!(geometry.region_bytes(), MIN_REGION_SIZE);
        assert_eq!(geometry.num_regions(), 256);
        assert_eq!(geometry.cards_per_region(), 2048);
        assert_eq!(geometry.region_index_for(Address::from_usize(TEST_HEAP_BASE) + 3 * MIN_REGION_SIZE + 5), 3);
    }

    #[test]
    fn forced_region_size_is_clamped() {
        let mut options = Options::new();
        assert!(options.set_from_str("heap_region_size", &(64 * BYTES_IN_MBYTE).to_string()));
        let geometry = HeapGeometry::new(
            Address::from_usize(TEST_HEAP_BASE),
            256 * BYTES_IN_MBYTE,
            &options,
        )
        .unwrap();
        assert_eq!(geometry.region_bytes(), MAX_REGION_SIZE);
    }

    #[test]
    fn table_swap_and_handshake() {
        let (heap, _) = test_heap_with_scanner();
        let mutator = heap.register_mutator();

        let ct_before = heap.card_table() as *const CardTable;
        let rt_before = heap.refinement_table() as *const CardTable;
        assert_eq!(mutator.card_table_base_for_test(), ct_before);

        heap.swap_global_card_table();
        assert_eq!(heap.card_table() as *const CardTable, rt_before);
        // The mutator still writes through its stale base until the
        // handshake runs.
        assert_eq!(mutator.card_table_base_for_test(), ct_before);
        heap.handshake_mutator_card_tables();
        assert_eq!(mutator.card_table_base_for_test(), rt_before);
    }

    #[test]
    fn barrier_dirties_current_mutator_table() {
        let (heap, _) = test_heap_with_scanner();
        let mutator = heap.register_mutator();
        let addr = Address::from_usize(TEST_HEAP_BASE) + 17 * BYTES_IN_CARD;

        mutator.write_barrier(addr);
        assert_eq!(heap.card_table().get(17), card_table::DIRTY_CARD);
        assert!(heap.refinement_table().is_clean(17));

        heap.swap_global_card_table();
        heap.handshake_mutator_card_tables();
        mutator.write_barrier(addr + BYTES_IN_CARD);
        // The new dirty landed on the new card table, which is the old
        // refinement table.
        assert_eq!(heap.card_table().get(18), card_table::DIRTY_CARD);
        assert_eq!(heap.refinement_table().get(17), card_table::DIRTY_CARD);
    }

    #[test]
    fn region_lifecycle() {
        let (heap, _) = test_heap_with_scanner();
        heap.allocate_region(3, RegionKind::Eden);
        assert!(heap.region(3).is_young());
        assert!(heap.region(3).rem_set().is_complete());
        heap.free_region(3);
        assert!(heap.region(3).is_free());
        assert!(!heap.region(3).rem_set().is_tracked());
    }
}
