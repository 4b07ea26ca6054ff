//! The per-region remembered set: a card set plus tracking state and the
//! region's code root set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use delegate::delegate;

use crate::util::constants::LOG_BYTES_IN_CARD;
use crate::util::Address;

use super::config::CardSetConfig;
use super::containers::{AddResult, CardOrRangeVisitor, IterateTag};
use super::from_card_cache::FromCardCache;
use super::CardSet;

/// Remembered set maintenance state.
///
/// `Untracked`: not maintained, containers empty. `Updating`: selected for
/// rebuild by remark, concurrent rebuild in progress. `Complete`: the set
/// is authoritative and consulted at GC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemSetState {
    Untracked = 0,
    Updating = 1,
    Complete = 2,
}

/// Visitor for [`RegionRemSet::iterate_for_merge`]: cards are delivered as
/// (source heap region, card index within that region).
pub trait MergeCardVisitor {
    /// About to iterate one container holding cards of `region_idx`.
    /// Returning false skips it.
    fn start_iterate(&mut self, tag: IterateTag, region_idx: u32) -> bool;
    fn do_card(&mut self, card_in_region: u32);
    fn do_card_range(&mut self, start_card: u32, length: u32);
}

pub struct RegionRemSet {
    region_idx: u32,
    heap_base: Address,
    state: AtomicU8,
    card_set: CardSet,
    code_roots: spin::Mutex<HashSet<usize>>,
    from_card_cache: Arc<FromCardCache>,
}

impl RegionRemSet {
    pub fn new(
        region_idx: u32,
        config: Arc<CardSetConfig>,
        from_card_cache: Arc<FromCardCache>,
        heap_base: Address,
    ) -> RegionRemSet {
        RegionRemSet {
            region_idx,
            heap_base,
            state: AtomicU8::new(RemSetState::Untracked as u8),
            card_set: CardSet::new(config),
            code_roots: spin::Mutex::new(HashSet::new()),
            from_card_cache,
        }
    }

    pub fn state(&self) -> RemSetState {
        match self.state.load(Ordering::Acquire) {
            0 => RemSetState::Untracked,
            1 => RemSetState::Updating,
            _ => RemSetState::Complete,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.state() != RemSetState::Untracked
    }

    pub fn is_updating(&self) -> bool {
        self.state() == RemSetState::Updating
    }

    pub fn is_complete(&self) -> bool {
        self.state() == RemSetState::Complete
    }

    fn clear_fcc(&self) {
        self.from_card_cache.clear_region(self.region_idx);
    }

    pub fn set_state_untracked(&self) {
        if self.state() == RemSetState::Untracked {
            return;
        }
        self.clear_fcc();
        self.state.store(RemSetState::Untracked as u8, Ordering::Release);
    }

    pub fn set_state_updating(&self) {
        debug_assert!(
            !self.is_tracked(),
            "region {} should only become Updating from Untracked",
            self.region_idx
        );
        self.clear_fcc();
        self.state.store(RemSetState::Updating as u8, Ordering::Release);
    }

    pub fn set_state_complete(&self) {
        self.clear_fcc();
        self.state.store(RemSetState::Complete as u8, Ordering::Release);
    }

    fn to_card(&self, from: Address) -> usize {
        (from - self.heap_base) >> LOG_BYTES_IN_CARD
    }

    /// Record that the field at `from` may hold a reference into this
    /// region.
    pub fn add_reference(&self, from: Address, worker_id: usize) -> AddResult {
        debug_assert!(self.is_tracked(), "region {} remset not tracked", self.region_idx);

        let from_card = self.to_card(from);
        if self
            .from_card_cache
            .contains_or_replace(worker_id, self.region_idx, from_card)
        {
            // This worker just added the very same card; the container may
            // be in the middle of a coarsening, so no stronger check than
            // the cache hit is possible here.
            return AddResult::Found;
        }
        self.card_set.add_card(from_card)
    }

    pub fn contains_reference(&self, from: Address) -> bool {
        self.card_set.contains_card(self.to_card(from))
    }

    /// Iterate every card for the STW merge phase, recombining the card
    /// set's internal card-region keys into (heap region, card-in-region)
    /// coordinates.
    pub fn iterate_for_merge<V: MergeCardVisitor>(&self, visitor: &mut V) {
        struct Recombine<'a, V> {
            visitor: &'a mut V,
            region_idx: u32,
            offset: u32,
        }
        impl<V: MergeCardVisitor> CardOrRangeVisitor for Recombine<'_, V> {
            fn start_iterate(&mut self, tag: IterateTag) -> bool {
                self.visitor.start_iterate(tag, self.region_idx)
            }
            fn do_card(&mut self, card: u32) {
                self.visitor.do_card(card + self.offset);
            }
            fn do_card_range(&mut self, start: u32, length: u32) {
                self.visitor.do_card_range(start + self.offset, length);
            }
        }

        let config = self.card_set.config();
        let log_card_regions = config.log2_card_regions_per_heap_region();
        let card_region_mask = (1u32 << log_card_regions) - 1;
        let log_card_region_size = config.log2_cards_per_card_region();

        let mut entries = Vec::new();
        self.card_set.iterate_containers(true, |value| {
            entries.push((value.region_idx(), value.container_ptr()));
        });
        for (card_region_idx, container) in entries {
            let mut recombine = Recombine {
                visitor,
                region_idx: card_region_idx >> log_card_regions,
                offset: (card_region_idx & card_region_mask) << log_card_region_size,
            };
            self.card_set
                .iterate_cards_or_ranges_in_container(container, &mut recombine);
        }
    }

    /// Drop remembered set content. With `only_cardset` the code roots are
    /// kept; with `keep_tracked` the tracking state survives (used by
    /// humongous eager-reclaim candidates that stay tracked).
    pub fn clear(&self, only_cardset: bool, keep_tracked: bool) {
        if !only_cardset {
            self.code_roots.lock().clear();
        }
        self.clear_fcc();
        self.card_set.clear();
        if !keep_tracked {
            self.set_state_untracked();
        } else {
            debug_assert!(self.is_tracked(), "must stay tracked");
        }
        debug_assert_eq!(self.occupied(), 0, "should be clear");
    }

    pub fn card_set(&self) -> &CardSet {
        &self.card_set
    }

    delegate! {
        to self.card_set {
            pub fn occupied(&self) -> usize;
            pub fn is_empty(&self) -> bool;
            pub fn occupancy_less_or_equal_to(&self, limit: usize) -> bool;
            pub fn mem_size(&self) -> usize;
        }
    }

    // --- Code roots -------------------------------------------------------

    pub fn add_code_root(&self, method: usize) {
        self.code_roots.lock().insert(method);
    }

    pub fn remove_code_root(&self, method: usize) {
        let mut roots = self.code_roots.lock();
        roots.remove(&method);
        debug_assert!(!roots.contains(&method), "duplicate code root entry");
    }

    pub fn code_roots_do(&self, mut f: impl FnMut(usize)) {
        for method in self.code_roots.lock().iter() {
            f(*method);
        }
    }

    pub fn num_code_roots(&self) -> usize {
        self.code_roots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardset::config;
    use crate::util::constants::BYTES_IN_CARD;

    fn remset(region_idx: u32) -> RegionRemSet {
        let config = Arc::new(config::small_config());
        let fcc = Arc::new(FromCardCache::new(2, 16));
        let set = RegionRemSet::new(region_idx, config, fcc, Address::ZERO);
        set.set_state_complete();
        set
    }

    #[test]
    fn state_transitions() {
        let config = Arc::new(config::small_config());
        let fcc = Arc::new(FromCardCache::new(1, 16));
        let set = RegionRemSet::new(0, config, fcc, Address::ZERO);

        assert_eq!(set.state(), RemSetState::Untracked);
        set.set_state_updating();
        assert!(set.is_updating() && set.is_tracked());
        set.set_state_complete();
        assert!(set.is_complete());
        set.clear(false, false);
        assert_eq!(set.state(), RemSetState::Untracked);
    }

    #[test]
    fn add_reference_is_card_granular() {
        let set = remset(5);
        let base = Address::from_usize(17 * BYTES_IN_CARD);
        assert_eq!(set.add_reference(base + 8, 0), AddResult::Added);
        // Same card, same worker: short-circuits in the from-card cache.
        assert_eq!(set.add_reference(base + 16, 0), AddResult::Found);
        // Same card, different worker: found in the card set itself.
        assert_eq!(set.add_reference(base + 24, 1), AddResult::Found);
        assert!(set.contains_reference(base));
        assert_eq!(set.occupied(), 1);
    }

    #[test]
    fn clear_only_cardset_keeps_code_roots() {
        let set = remset(1);
        set.add_code_root(0xbeef);
        set.add_reference(Address::from_usize(123 * BYTES_IN_CARD), 0);

        set.clear(true, true);
        assert_eq!(set.occupied(), 0);
        assert_eq!(set.num_code_roots(), 1);
        assert!(set.is_complete());

        set.clear(false, false);
        assert_eq!(set.num_code_roots(), 0);
        assert!(!set.is_tracked());
    }

    #[test]
    fn merge_iteration_recombines_card_regions() {
        // Two card regions per heap region, 1024 cards each.
        let config = Arc::new(crate::cardset::config::CardSetConfig::with_geometry(
            8, 90, 8, 90, 1024, 1,
        ));
        let fcc = Arc::new(FromCardCache::new(1, 16));
        let set = RegionRemSet::new(0, config, fcc, Address::ZERO);
        set.set_state_complete();

        // Card 1500 is card 476 of card region 1, i.e. card 1500 of heap
        // region 0.
        set.add_reference(Address::from_usize(1500 * BYTES_IN_CARD), 0);
        // Card 3000 belongs to heap region 1 (card regions 2/3).
        set.add_reference(Address::from_usize(3000 * BYTES_IN_CARD), 0);

        struct Collect {
            cards: Vec<(u32, u32)>,
            region: u32,
        }
        impl MergeCardVisitor for Collect {
            fn start_iterate(&mut self, _tag: IterateTag, region_idx: u32) -> bool {
                self.region = region_idx;
                true
            }
            fn do_card(&mut self, card: u32) {
                self.cards.push((self.region, card));
            }
            fn do_card_range(&mut self, start: u32, length: u32) {
                for card in start..start + length {
                    self.cards.push((self.region, card));
                }
            }
        }

        let mut collect = Collect { cards: Vec::new(), region: u32::MAX };
        set.iterate_for_merge(&mut collect);
        collect.cards.sort_unstable();
        assert_eq!(collect.cards, vec![(0, 1500), (1, 952)]);
    }
}
