//! The per-region, lock-free, adaptively coarsening card set.
//!
//! Each region's remembered set stores the indices of cards that may hold
//! references into the region. Card indices are kept in one of four
//! container representations forming a lattice: an inline pointer for very
//! sparse sets, a small array, a bucketed fan-out ("howl") whose buckets
//! are themselves inline/array/bitmap containers, and a reserved full
//! sentinel once tracking individual cards stops paying off. Containers
//! are swapped for coarser ones by CAS; readers protect themselves with a
//! grace-period critical section plus per-container reference counts.

pub mod arena;
pub mod config;
pub mod containers;
pub mod from_card_cache;
pub mod hash_table;
pub mod rem_set;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use enum_map::{Enum, EnumMap};

use crate::util::epoch;

use arena::{MemObjectType, MemoryManager};
use config::CardSetConfig;
use containers::{
    inline_contains, inline_iterate, AddResult, CardOrRangeVisitor, CardSetArray, CardSetBitmap,
    CardSetHowl, ContainerPtr, ContainerTag, InlinePtr, IterateTag,
};
use hash_table::{CardSetHashTable, CardSetHashTableValue};

/// The six coarsening transitions: three at the top level of a region's
/// container, three within a howl's buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum CoarsenTransition {
    InlineToArray,
    ArrayToHowl,
    HowlToFull,
    HowlInlineToArray,
    HowlArrayToBitmap,
    HowlBitmapToFull,
}

#[derive(Default)]
struct TransitionCounts {
    attempts: AtomicUsize,
    collisions: AtomicUsize,
}

/// Process-wide coarsening statistics.
#[derive(Default)]
pub struct CoarsenStats {
    counts: EnumMap<CoarsenTransition, TransitionCounts>,
}

impl CoarsenStats {
    fn record(&self, transition: CoarsenTransition, collision: bool) {
        self.counts[transition].attempts.fetch_add(1, Ordering::Relaxed);
        if collision {
            self.counts[transition].collisions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn attempts(&self, transition: CoarsenTransition) -> usize {
        self.counts[transition].attempts.load(Ordering::Relaxed)
    }

    pub fn collisions(&self, transition: CoarsenTransition) -> usize {
        self.counts[transition].collisions.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> EnumMap<CoarsenTransition, (usize, usize)> {
        let mut snap = EnumMap::default();
        for (transition, counts) in self.counts.iter() {
            snap[transition] = (
                counts.attempts.load(Ordering::Relaxed),
                counts.collisions.load(Ordering::Relaxed),
            );
        }
        snap
    }
}

lazy_static! {
    static ref COARSEN_STATS: CoarsenStats = CoarsenStats::default();
    static ref LAST_COARSEN_SNAPSHOT: spin::Mutex<EnumMap<CoarsenTransition, (usize, usize)>> =
        spin::Mutex::new(EnumMap::default());
}

/// The process-wide coarsening statistics.
pub fn coarsen_stats() -> &'static CoarsenStats {
    &COARSEN_STATS
}

fn format_snapshot(snap: &EnumMap<CoarsenTransition, (usize, usize)>) -> String {
    snap.iter()
        .map(|(transition, (attempts, collisions))| {
            format!("{transition:?} {attempts} ({collisions})")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log recent (since the previous call) and cumulative coarsening counts.
pub fn print_coarsen_stats() {
    let current = COARSEN_STATS.snapshot();
    let mut last = LAST_COARSEN_SNAPSHOT.lock();
    let mut recent = EnumMap::default();
    for (transition, &(attempts, collisions)) in current.iter() {
        let (last_attempts, last_collisions) = last[transition];
        recent[transition] = (attempts - last_attempts, collisions - last_collisions);
    }
    debug!("coarsening (recent): {}", format_snapshot(&recent));
    debug!("coarsening (all): {}", format_snapshot(&current));
    *last = current;
}

fn transition_for(tag: ContainerTag, within_howl: bool) -> CoarsenTransition {
    match (tag, within_howl) {
        (ContainerTag::Inline, false) => CoarsenTransition::InlineToArray,
        (ContainerTag::Array, false) => CoarsenTransition::ArrayToHowl,
        (ContainerTag::Howl, false) => CoarsenTransition::HowlToFull,
        (ContainerTag::Inline, true) => CoarsenTransition::HowlInlineToArray,
        (ContainerTag::Array, true) => CoarsenTransition::HowlArrayToBitmap,
        (ContainerTag::Bitmap, true) => CoarsenTransition::HowlBitmapToFull,
        _ => unreachable!("no coarsening from {tag:?} (within_howl: {within_howl})"),
    }
}

/// A conservative set of card indices for one region, keyed internally by
/// card region (see [`CardSetConfig`] for the region virtualization).
pub struct CardSet {
    config: Arc<CardSetConfig>,
    mm: MemoryManager,
    table: CardSetHashTable,
    num_occupied: AtomicUsize,
}

impl CardSet {
    pub fn new(config: Arc<CardSetConfig>) -> CardSet {
        let mm = MemoryManager::new(&config);
        CardSet {
            config,
            mm,
            table: CardSetHashTable::new(),
            num_occupied: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &CardSetConfig {
        &self.config
    }

    /// Number of cards in the set. Monotone between clears; a lower bound
    /// that may slightly overcount around coarsening races.
    pub fn occupied(&self) -> usize {
        self.num_occupied.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn occupancy_less_or_equal_to(&self, limit: usize) -> bool {
        self.occupied() <= limit
    }

    // --- Container memory -------------------------------------------------

    fn mem_object_type(tag: ContainerTag) -> MemObjectType {
        match tag {
            ContainerTag::Array => MemObjectType::Array,
            ContainerTag::Bitmap => MemObjectType::Bitmap,
            ContainerTag::Howl => MemObjectType::Howl,
            ContainerTag::Inline => unreachable!("inline containers are not allocated"),
        }
    }

    fn free_mem_object(&self, container: ContainerPtr) {
        debug_assert!(!container.is_full(), "must not free the full sentinel");
        debug_assert_eq!(unsafe { container.header() }.refcount(), 1);
        self.mm
            .free(Self::mem_object_type(container.tag()), container.strip());
    }

    /// Load a container from `slot` and pin it against concurrent freeing.
    /// Inline and full containers need no pin (nothing to free); heap
    /// containers get a reference count, taken under a critical section so
    /// the count cannot be taken on memory that was already reused.
    fn acquire_container(&self, slot: &AtomicUsize) -> ContainerPtr {
        let _cs = epoch::critical_section();
        loop {
            let container = ContainerPtr::from_raw(slot.load(Ordering::Acquire));
            if container.is_full() || container.tag() == ContainerTag::Inline {
                return container;
            }
            if unsafe { container.header() }.try_increment_refcount() {
                debug_assert!(unsafe { container.header() }.refcount() >= 3);
                return container;
            }
        }
    }

    /// Drop a reference. Returns true when the caller dropped the last one
    /// and must free the container.
    fn release_container(&self, container: ContainerPtr) -> bool {
        if container.is_full() || container.tag() == ContainerTag::Inline {
            return false;
        }
        unsafe { container.header() }.decrement_refcount() == 1
    }

    fn release_and_maybe_free_container(&self, container: ContainerPtr) {
        if self.release_container(container) {
            self.free_mem_object(container);
        }
    }

    fn release_and_must_free_container(&self, container: ContainerPtr) {
        let should_free = self.release_container(container);
        debug_assert!(should_free, "should have been the only reference");
        self.free_mem_object(container);
    }

    // --- Adding cards -----------------------------------------------------

    /// Add a global card index.
    pub fn add_card(&self, card: usize) -> AddResult {
        let (card_region, card_in_region) = self.config.split_card(card);
        self.add_card_parts(card_region, card_in_region, true)
    }

    /// Add a card given as (card region, card within card region).
    pub fn add_card_parts(
        &self,
        card_region: u32,
        card_in_region: u32,
        increment_total: bool,
    ) -> AddResult {
        let mut should_grow_table = false;
        let table_entry = self
            .table
            .get_or_add(&self.mm, card_region, &mut should_grow_table);

        let mut to_transfer = None;
        let (add_result, container) = loop {
            let container = self.acquire_container(&table_entry.container);
            let result = self.add_to_container(
                &table_entry.container,
                container,
                card_region,
                card_in_region,
                increment_total,
            );
            if result != AddResult::Overflow {
                break (result, container);
            }
            // Container overflowed: coarsen or retry against whoever beat
            // us to it.
            let coarsened =
                self.coarsen_container(&table_entry.container, container, card_in_region, false);
            COARSEN_STATS.record(transition_for(container.tag(), false), !coarsened);
            if coarsened {
                // Coarsening also added the card.
                to_transfer = Some(container);
                break (AddResult::Added, container);
            }
            self.release_and_maybe_free_container(container);
        };

        if increment_total && add_result == AddResult::Added {
            table_entry.num_occupied.fetch_add(1, Ordering::Relaxed);
            self.num_occupied.fetch_add(1, Ordering::Relaxed);
        }
        if should_grow_table {
            self.table.grow();
        }
        if let Some(source) = to_transfer {
            self.transfer_cards(table_entry, source, card_region);
        }

        self.release_and_maybe_free_container(container);
        add_result
    }

    fn add_to_container(
        &self,
        slot: &AtomicUsize,
        container: ContainerPtr,
        card_region: u32,
        card_in_region: u32,
        increment_total: bool,
    ) -> AddResult {
        match container.tag() {
            ContainerTag::Inline => {
                let mut inline = InlinePtr::new(slot, container.as_raw());
                inline.add(
                    card_in_region,
                    self.config.inline_ptr_bits_per_card(),
                    self.config.max_cards_in_inline_ptr(),
                )
            }
            ContainerTag::Array => {
                unsafe { container.deref::<CardSetArray>() }.add(card_in_region)
            }
            ContainerTag::Bitmap => unsafe { container.deref::<CardSetBitmap>() }.add(
                self.config.howl_bitmap_offset(card_in_region),
                self.config.cards_in_howl_bitmap_threshold(),
                self.config.max_cards_in_howl_bitmap(),
            ),
            ContainerTag::Howl => {
                if container.is_full() {
                    return AddResult::Found;
                }
                self.add_to_howl(container, card_region, card_in_region, increment_total)
            }
        }
    }

    fn add_to_howl(
        &self,
        parent: ContainerPtr,
        card_region: u32,
        card_in_region: u32,
        increment_total: bool,
    ) -> AddResult {
        let howl = unsafe { parent.deref::<CardSetHowl>() };
        let bucket = howl.bucket(self.config.howl_bucket_index(card_in_region));

        let mut to_transfer = None;
        let (add_result, container) = loop {
            if howl.num_entries.load(Ordering::Relaxed) >= self.config.cards_in_howl_threshold() {
                return AddResult::Overflow;
            }

            let container = self.acquire_container(bucket);
            let result =
                self.add_to_container(bucket, container, card_region, card_in_region, increment_total);
            if result != AddResult::Overflow {
                break (result, container);
            }
            let coarsened = self.coarsen_container(bucket, container, card_in_region, true);
            COARSEN_STATS.record(transition_for(container.tag(), true), !coarsened);
            if coarsened {
                to_transfer = Some(container);
                break (AddResult::Added, container);
            }
            self.release_and_maybe_free_container(container);
        };

        if increment_total && add_result == AddResult::Added {
            howl.num_entries.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(source) = to_transfer {
            self.transfer_cards_in_howl(parent, source, card_region);
        }

        self.release_and_maybe_free_container(container);
        add_result
    }

    // --- Coarsening -------------------------------------------------------

    /// Publish a coarser container for `slot`, currently holding
    /// `cur_container`, such that the new container already includes
    /// `card_in_region`. Returns false if another thread changed the slot
    /// first; the caller then retries its add.
    fn coarsen_container(
        &self,
        slot: &AtomicUsize,
        cur_container: ContainerPtr,
        card_in_region: u32,
        within_howl: bool,
    ) -> bool {
        let new_container = match cur_container.tag() {
            ContainerTag::Inline => {
                let mem = self.mm.allocate(MemObjectType::Array);
                let capacity = self.config.max_cards_in_array();
                unsafe { CardSetArray::init_at(mem, card_in_region, capacity) };
                ContainerPtr::make(mem, ContainerTag::Array)
            }
            ContainerTag::Array => {
                if within_howl {
                    let mem = self.mm.allocate(MemObjectType::Bitmap);
                    unsafe {
                        CardSetBitmap::init_at(
                            mem,
                            self.config.howl_bitmap_offset(card_in_region),
                            self.config.max_cards_in_howl_bitmap(),
                        )
                    };
                    ContainerPtr::make(mem, ContainerTag::Bitmap)
                } else {
                    let mem = self.mm.allocate(MemObjectType::Howl);
                    unsafe { CardSetHowl::init_at(mem, card_in_region, &self.config) };
                    ContainerPtr::make(mem, ContainerTag::Howl)
                }
            }
            // The new representation subsumes every card; nothing to build.
            ContainerTag::Bitmap | ContainerTag::Howl => ContainerPtr::FULL,
        };

        match slot.compare_exchange(
            cur_container.as_raw(),
            new_container.as_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // The slot's reference to the old container is gone; the
                // caller still holds its own, so the count cannot hit the
                // tombstone here.
                let should_free = self.release_container(cur_container);
                debug_assert!(!should_free, "caller must still hold a reference");
                if cur_container.tag() == ContainerTag::Howl && !cur_container.is_full() {
                    self.release_howl_buckets(cur_container);
                }
                true
            }
            Err(_) => {
                if !new_container.is_full() {
                    self.release_and_must_free_container(new_container);
                }
                false
            }
        }
    }

    /// Upgrade every bucket of a detached howl to the full sentinel,
    /// releasing the bucket containers.
    fn release_howl_buckets(&self, howl_ptr: ContainerPtr) {
        let howl = unsafe { howl_ptr.deref::<CardSetHowl>() };
        for index in 0..self.config.num_buckets_in_howl() {
            let bucket = howl.bucket(index);
            loop {
                let cur = ContainerPtr::from_raw(bucket.load(Ordering::Acquire));
                if cur.is_full() {
                    break;
                }
                if bucket
                    .compare_exchange(
                        cur.as_raw(),
                        ContainerPtr::FULL.as_raw(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.release_and_maybe_free_container(cur);
                    break;
                }
            }
        }
    }

    /// Move the cards of a replaced top-level container into the new one.
    fn transfer_cards(
        &self,
        table_entry: &CardSetHashTableValue,
        source: ContainerPtr,
        card_region: u32,
    ) {
        debug_assert!(!source.is_full(), "nothing transfers from the full sentinel");
        if source.tag() != ContainerTag::Howl {
            self.iterate_cards_during_transfer(source, |card| {
                self.add_card_parts(card_region, card, false);
            });
        } else {
            // Howl became Full: the sentinel spans every card of the card
            // region, so compensate the per-region count for the capacity
            // the explicit cards did not cover. The card that triggered
            // the coarsening has already been counted.
            let occupied = table_entry.num_occupied.load(Ordering::Relaxed);
            let delta = self.config.max_cards_in_region() as usize - occupied;
            self.num_occupied.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Move the cards of a replaced howl bucket container into the new one.
    fn transfer_cards_in_howl(
        &self,
        parent: ContainerPtr,
        source: ContainerPtr,
        card_region: u32,
    ) {
        debug_assert_eq!(parent.tag(), ContainerTag::Howl);
        debug_assert!(!source.is_full());
        if source.tag() != ContainerTag::Bitmap {
            self.iterate_cards_during_transfer(source, |card| {
                self.add_card_parts(card_region, card, false);
            });
        } else {
            // Bitmap became Full. One card less than the uncovered
            // capacity: the triggering card is counted by the caller.
            let bits_set = unsafe { source.deref::<CardSetBitmap>() }.num_bits_set() as usize;
            let delta = self.config.max_cards_in_howl_bitmap() as usize - bits_set - 1;

            let howl = unsafe { parent.deref::<CardSetHowl>() };
            howl.num_entries.fetch_add(delta as u32, Ordering::Relaxed);

            let table_entry = self
                .table
                .get(card_region)
                .expect("table entry missing for transferred cards");
            table_entry.num_occupied.fetch_add(delta, Ordering::Relaxed);
            self.num_occupied.fetch_add(delta, Ordering::Relaxed);
        }
    }

    fn iterate_cards_during_transfer(&self, source: ContainerPtr, mut f: impl FnMut(u32)) {
        match source.tag() {
            ContainerTag::Inline => {
                inline_iterate(source.as_raw(), self.config.inline_ptr_bits_per_card(), &mut f)
            }
            ContainerTag::Array => unsafe { source.deref::<CardSetArray>() }.iterate(&mut f),
            tag => unreachable!("invalid container type {tag:?} to transfer from"),
        }
    }

    // --- Lookup -----------------------------------------------------------

    pub fn contains_card(&self, card: usize) -> bool {
        let (card_region, card_in_region) = self.config.split_card(card);
        self.contains_card_parts(card_region, card_in_region)
    }

    pub fn contains_card_parts(&self, card_region: u32, card_in_region: u32) -> bool {
        debug_assert!(card_in_region < self.config.max_cards_in_region());

        // Keep the containers alive for the duration of the lookup.
        let _cs = epoch::critical_section();
        let Some(table_entry) = self.table.get(card_region) else {
            return false;
        };

        let container = table_entry.container_ptr();
        if container.is_full() {
            return true;
        }
        match container.tag() {
            ContainerTag::Inline => inline_contains(
                container.as_raw(),
                card_in_region,
                self.config.inline_ptr_bits_per_card(),
            ),
            ContainerTag::Array => {
                unsafe { container.deref::<CardSetArray>() }.contains(card_in_region)
            }
            ContainerTag::Bitmap => unsafe { container.deref::<CardSetBitmap>() }.contains(
                self.config.howl_bitmap_offset(card_in_region),
                self.config.max_cards_in_howl_bitmap(),
            ),
            ContainerTag::Howl => {
                unsafe { container.deref::<CardSetHowl>() }.contains(card_in_region, &self.config)
            }
        }
    }

    // --- Iteration --------------------------------------------------------

    /// Visit every (card region, occupancy, container) triple.
    ///
    /// With `at_safepoint` the underlying table scan assumes no concurrent
    /// mutation; otherwise callers that dereference the container must do
    /// so inside a critical section.
    pub fn iterate_containers(
        &self,
        at_safepoint: bool,
        mut f: impl FnMut(&CardSetHashTableValue),
    ) {
        if at_safepoint {
            self.table.iterate_safepoint(&mut f);
        } else {
            self.table.iterate(&mut f);
        }
    }

    /// Iterate the cards or card ranges of one container, dispatching on
    /// its representation.
    pub fn iterate_cards_or_ranges_in_container<V: CardOrRangeVisitor>(
        &self,
        container: ContainerPtr,
        visitor: &mut V,
    ) {
        match container.tag() {
            ContainerTag::Inline => {
                if visitor.start_iterate(IterateTag::Inline) {
                    inline_iterate(
                        container.as_raw(),
                        self.config.inline_ptr_bits_per_card(),
                        |card| visitor.do_card(card),
                    );
                }
            }
            ContainerTag::Array => {
                if visitor.start_iterate(IterateTag::Array) {
                    unsafe { container.deref::<CardSetArray>() }
                        .iterate(|card| visitor.do_card(card));
                }
            }
            ContainerTag::Bitmap => {
                // There is no region-spanning bitmap at the top level.
                unreachable!("top-level bitmap container");
            }
            ContainerTag::Howl => {
                if container.is_full() {
                    if visitor.start_iterate(IterateTag::Full) {
                        visitor.do_card_range(0, self.config.max_cards_in_region());
                    }
                } else if visitor.start_iterate(IterateTag::Howl) {
                    unsafe { container.deref::<CardSetHowl>() }.iterate(&self.config, visitor);
                }
            }
        }
    }

    /// Visit every (card region, card) pair in the set. Safepoint only.
    pub fn iterate_cards(&self, mut f: impl FnMut(u32, u32)) {
        struct Expand<'a, F> {
            region: u32,
            f: &'a mut F,
        }
        impl<F: FnMut(u32, u32)> CardOrRangeVisitor for Expand<'_, F> {
            fn do_card(&mut self, card: u32) {
                (self.f)(self.region, card);
            }
            fn do_card_range(&mut self, start: u32, length: u32) {
                for card in start..start + length {
                    (self.f)(self.region, card);
                }
            }
        }

        let mut entries = Vec::new();
        self.iterate_containers(true, |value| {
            entries.push((value.region_idx(), value.container_ptr()));
        });
        for (region, container) in entries {
            let mut expand = Expand { region, f: &mut f };
            self.iterate_cards_or_ranges_in_container(container, &mut expand);
        }
    }

    /// Number of containers currently in the table.
    pub fn num_containers(&self) -> usize {
        let mut count = 0;
        self.iterate_containers(false, |_| count += 1);
        count
    }

    // --- Lifecycle --------------------------------------------------------

    /// Empty the set and release all its memory. Must not race with any
    /// reader or writer (called at safepoint, or before the set is
    /// published).
    pub fn clear(&self) {
        self.table.reset();
        self.num_occupied.store(0, Ordering::Relaxed);
        self.mm.flush();
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.table.mem_size() + self.mm.mem_size()
    }

    pub fn unused_mem_size(&self) -> usize {
        self.mm.unused_mem_size()
    }
}

impl Drop for CardSet {
    fn drop(&mut self) {
        self.table.reset();
    }
}
