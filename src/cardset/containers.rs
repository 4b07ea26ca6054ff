//! The four card container representations and their tagged pointer.
//!
//! A container pointer packs a 2-bit representation tag into the low bits
//! of an arena slot address. The inline representation needs no slot at
//! all: its cards live in the pointer word itself. Heap-allocated
//! containers (array, bitmap, howl) start with a reference-count header
//! used for safe reclamation while readers race with coarsening.
//!
//! Containers are variable-size: a fixed header followed by trailing
//! storage sized by the configuration. They are constructed in place in
//! arena slots and accessed through raw pointers; all trailing storage is
//! atomic cells so concurrent readers are sound.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::util::constants::*;

use super::config::CardSetConfig;

/// Entry type of the array container; must hold any in-container card
/// index (see `CARDS_PER_REGION_LIMIT`).
pub type CardEntry = u16;

/// Result of adding a card to a container or card set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The card was inserted by this call.
    Added,
    /// The card was already present.
    Found,
    /// The container has no room; the caller must coarsen.
    Overflow,
}

/// Container representation tag, stored in the low bits of the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerTag {
    Inline = 0,
    Array = 1,
    Bitmap = 2,
    Howl = 3,
}

/// What a visitor is about to iterate. Distinguishes the full sentinel
/// from a real howl, and bucket-level containers from top-level ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterateTag {
    Inline,
    Array,
    Bitmap,
    Howl,
    Full,
}

/// Visitor over the cards or card ranges of one container.
pub trait CardOrRangeVisitor {
    /// Called before iterating a container; returning false skips it.
    fn start_iterate(&mut self, _tag: IterateTag) -> bool {
        true
    }
    fn do_card(&mut self, card: u32);
    fn do_card_range(&mut self, start: u32, length: u32);
}

/// A tagged container pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ContainerPtr(usize);

impl ContainerPtr {
    const TAG_MASK: usize = 0b11;

    /// The empty inline container: all-zero word, inline tag, zero size.
    pub const EMPTY_INLINE: ContainerPtr = ContainerPtr(0);

    /// The reserved sentinel meaning "every card in the region is
    /// present". Compares pointer-equal to exactly this value; its tag is
    /// `Howl`.
    pub const FULL: ContainerPtr = ContainerPtr(usize::MAX);

    pub fn from_raw(raw: usize) -> Self {
        ContainerPtr(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn make(ptr: *mut u8, tag: ContainerTag) -> Self {
        debug_assert_eq!(ptr as usize & Self::TAG_MASK, 0, "slot not aligned");
        ContainerPtr(ptr as usize | tag as usize)
    }

    pub fn tag(self) -> ContainerTag {
        match self.0 & Self::TAG_MASK {
            0 => ContainerTag::Inline,
            1 => ContainerTag::Array,
            2 => ContainerTag::Bitmap,
            _ => ContainerTag::Howl,
        }
    }

    pub fn is_full(self) -> bool {
        self == Self::FULL
    }

    /// The slot address with the tag stripped.
    pub fn strip(self) -> *mut u8 {
        (self.0 & !Self::TAG_MASK) as *mut u8
    }

    /// # Safety
    /// The pointer must be a live, non-full heap container of type `T`.
    pub unsafe fn deref<T>(self) -> &'static T {
        debug_assert!(!self.is_full());
        &*(self.strip() as *const T)
    }

    /// The refcount header of a heap container.
    ///
    /// # Safety
    /// Must be a live, non-full heap container (array, bitmap or howl).
    pub unsafe fn header(self) -> &'static ContainerHeader {
        debug_assert!(self.tag() != ContainerTag::Inline && !self.is_full());
        &*(self.strip() as *const ContainerHeader)
    }
}

impl std::fmt::Debug for ContainerPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_full() {
            write!(f, "Full")
        } else {
            write!(f, "{:?}({:#x})", self.tag(), self.0 & !Self::TAG_MASK)
        }
    }
}

/// Reference-count header of heap containers.
///
/// Live counts are odd and at least 3: the low bit doubles as the liveness
/// flag, so a count of 1 is the tombstone left after the last reference
/// was dropped. The hash table slot (or howl bucket) holds one logical
/// reference; every acquiring reader holds another.
#[repr(C)]
pub struct ContainerHeader {
    ref_count: AtomicUsize,
}

impl ContainerHeader {
    fn init(&self) {
        self.ref_count.store(3, Ordering::Relaxed);
    }

    pub fn refcount(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Add a reference unless the container is already tombstoned.
    pub fn try_increment_refcount(&self) -> bool {
        let mut old = self.refcount();
        loop {
            // Reference counts are odd numbers starting at 3; even or < 3
            // means reclaimed, cannot revive.
            if old < 3 || old & 0x1 == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                old,
                old + 2,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Drop a reference; returns the new count. A result of 1 means the
    /// caller dropped the last reference and must free the container.
    pub fn decrement_refcount(&self) -> usize {
        let old = self.refcount();
        debug_assert!(old & 0x1 != 0 && old >= 3, "refcount {old} not live");
        self.ref_count.fetch_sub(2, Ordering::AcqRel) - 2
    }
}

// --- Inline container -----------------------------------------------------

const INLINE_TAG_BITS: u32 = 2;
const INLINE_SIZE_BITS: u32 = 4;
const INLINE_SIZE_SHIFT: u32 = BITS_IN_WORD as u32 - INLINE_SIZE_BITS;
const INLINE_SIZE_MASK: usize = ((1 << INLINE_SIZE_BITS) - 1) << INLINE_SIZE_SHIFT;

/// Cards an inline pointer can hold for the given per-card field width.
pub fn max_cards_in_inline_ptr(bits_per_card: u32) -> u32 {
    let payload_bits = BITS_IN_WORD as u32 - INLINE_TAG_BITS - INLINE_SIZE_BITS;
    (payload_bits / bits_per_card).min((1 << INLINE_SIZE_BITS) - 1)
}

pub fn inline_num_cards(value: usize) -> u32 {
    (value >> INLINE_SIZE_SHIFT) as u32
}

fn inline_card_pos(index: u32, bits_per_card: u32) -> u32 {
    INLINE_TAG_BITS + index * bits_per_card
}

/// Index of `card` among the first `num_cards` entries, or `num_cards`.
fn inline_find(value: usize, card: u32, bits_per_card: u32, start: u32, num_cards: u32) -> u32 {
    let card_mask = (1usize << bits_per_card) - 1;
    let mut payload = value >> inline_card_pos(start, bits_per_card);
    for index in start..num_cards {
        if payload & card_mask == card as usize {
            return index;
        }
        payload >>= bits_per_card;
    }
    num_cards
}

pub fn inline_contains(value: usize, card: u32, bits_per_card: u32) -> bool {
    let num_cards = inline_num_cards(value);
    num_cards > 0 && inline_find(value, card, bits_per_card, 0, num_cards) < num_cards
}

pub fn inline_iterate(value: usize, bits_per_card: u32, mut f: impl FnMut(u32)) {
    let num_cards = inline_num_cards(value);
    let card_mask = (1usize << bits_per_card) - 1;
    let mut payload = value >> inline_card_pos(0, bits_per_card);
    for _ in 0..num_cards {
        f((payload & card_mask) as u32);
        payload >>= bits_per_card;
    }
}

/// Pack `card` as entry `index` into `value`, bumping the size field.
fn inline_merge(value: usize, card: u32, index: u32, bits_per_card: u32) -> usize {
    debug_assert!(card < (1 << bits_per_card), "card {card} does not fit field");
    let pos = inline_card_pos(index, bits_per_card);
    debug_assert!(pos + bits_per_card <= INLINE_SIZE_SHIFT, "entry would overlap size field");
    let new_fields = ((index as usize + 1) << INLINE_SIZE_SHIFT) | ((card as usize) << pos);
    (value & !INLINE_SIZE_MASK) | new_fields
}

/// Add/retry view of an inline container living in `slot`.
pub struct InlinePtr<'a> {
    slot: &'a AtomicUsize,
    value: usize,
}

impl<'a> InlinePtr<'a> {
    pub fn new(slot: &'a AtomicUsize, value: usize) -> Self {
        InlinePtr { slot, value }
    }

    pub fn add(&mut self, card: u32, bits_per_card: u32, max_cards: u32) -> AddResult {
        loop {
            let num_cards = inline_num_cards(self.value);
            if num_cards > 0
                && inline_find(self.value, card, bits_per_card, 0, num_cards) < num_cards
            {
                return AddResult::Found;
            }
            if num_cards >= max_cards {
                return AddResult::Overflow;
            }
            let new_value = inline_merge(self.value, card, num_cards, bits_per_card);
            match self.slot.compare_exchange(
                self.value,
                new_value,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return AddResult::Added,
                Err(current) => {
                    self.value = current;
                    // The slot may have been coarsened away from an inline
                    // container under us. Report Overflow so the caller
                    // re-dispatches on the new representation.
                    if ContainerPtr::from_raw(current).tag() != ContainerTag::Inline {
                        return AddResult::Overflow;
                    }
                }
            }
        }
    }
}

// --- Array container ------------------------------------------------------

const ARRAY_LOCK_BIT: u16 = 0x8000;
const ARRAY_ENTRY_MASK: u16 = 0x7fff;

/// A small unsorted array of card indices. The top bit of `num_entries`
/// is a spinlock guarding appends; lookups are lock-free.
#[repr(C)]
pub struct CardSetArray {
    header: ContainerHeader,
    size: u16,
    num_entries: AtomicU16,
}

impl CardSetArray {
    pub fn size_in_bytes(capacity: u32) -> usize {
        std::mem::size_of::<CardSetArray>() + capacity as usize * std::mem::size_of::<CardEntry>()
    }

    /// Construct in place with one initial card.
    ///
    /// # Safety
    /// `mem` must point at a word-aligned slot of at least
    /// `size_in_bytes(capacity)` bytes.
    pub unsafe fn init_at(mem: *mut u8, first_card: u32, capacity: u32) -> &'static CardSetArray {
        debug_assert!(capacity > 0 && capacity < ARRAY_LOCK_BIT as u32);
        let raw = mem as *mut CardSetArray;
        (*raw).size = capacity as u16;
        let array = &*raw;
        array.header.init();
        array.num_entries.store(1, Ordering::Relaxed);
        array.entry(0).store(first_card as CardEntry, Ordering::Relaxed);
        array
    }

    fn entry(&self, index: u16) -> &AtomicU16 {
        debug_assert!(index < self.size);
        unsafe {
            let base = (self as *const CardSetArray as *const u8)
                .add(std::mem::size_of::<CardSetArray>()) as *const AtomicU16;
            &*base.add(index as usize)
        }
    }

    fn at(&self, index: u16) -> CardEntry {
        self.entry(index).load(Ordering::Relaxed)
    }

    pub fn num_entries(&self) -> u16 {
        self.num_entries.load(Ordering::Acquire) & ARRAY_ENTRY_MASK
    }

    pub fn add(&self, card: u32) -> AddResult {
        debug_assert!(card <= CardEntry::MAX as u32);
        let card = card as CardEntry;

        let num_entries = self.num_entries();
        let mut index = 0;
        while index < num_entries {
            if self.at(index) == card {
                return AddResult::Found;
            }
            index += 1;
        }

        // Not found; lock for the append.
        let mut locker = ArrayLocker::new(&self.num_entries);

        // Cards may have been appended while we waited for the lock.
        let num_entries = locker.num_entries();
        while index < num_entries {
            if self.at(index) == card {
                return AddResult::Found;
            }
            index += 1;
        }

        if num_entries == self.size {
            return AddResult::Overflow;
        }

        self.entry(num_entries).store(card, Ordering::Relaxed);
        locker.inc_num_entries();
        AddResult::Added
    }

    pub fn contains(&self, card: u32) -> bool {
        let num_entries = self.num_entries();
        (0..num_entries).any(|index| self.at(index) as u32 == card)
    }

    pub fn iterate(&self, mut f: impl FnMut(u32)) {
        let num_entries = self.num_entries();
        for index in 0..num_entries {
            f(self.at(index) as u32);
        }
    }
}

/// Holds the array spinlock; releases it on drop, publishing the possibly
/// incremented entry count.
struct ArrayLocker<'a> {
    num_entries: &'a AtomicU16,
    local_num_entries: u16,
}

impl<'a> ArrayLocker<'a> {
    fn new(num_entries: &'a AtomicU16) -> Self {
        let backoff = Backoff::new();
        let mut current = num_entries.load(Ordering::Relaxed) & ARRAY_ENTRY_MASK;
        loop {
            match num_entries.compare_exchange(
                current,
                current | ARRAY_LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return ArrayLocker {
                        num_entries,
                        local_num_entries: current,
                    }
                }
                Err(observed) => {
                    current = observed & ARRAY_ENTRY_MASK;
                    backoff.snooze();
                }
            }
        }
    }

    fn num_entries(&self) -> u16 {
        self.local_num_entries
    }

    fn inc_num_entries(&mut self) {
        self.local_num_entries += 1;
    }
}

impl Drop for ArrayLocker<'_> {
    fn drop(&mut self) {
        self.num_entries
            .store(self.local_num_entries, Ordering::Release);
    }
}

// --- Bitmap container -----------------------------------------------------

/// Bytes of bitmap storage for `bits` bits, rounded up to whole words.
pub fn bitmap_bits_to_bytes(bits: usize) -> usize {
    bits.div_ceil(BITS_IN_WORD) * BYTES_IN_WORD
}

/// A raw bitmap over the cards of one howl bucket.
#[repr(C)]
pub struct CardSetBitmap {
    header: ContainerHeader,
    num_bits_set: AtomicU16,
}

impl CardSetBitmap {
    pub fn size_in_bytes(size_in_bits: u32) -> usize {
        std::mem::size_of::<CardSetBitmap>() + bitmap_bits_to_bytes(size_in_bits as usize)
    }

    /// Construct in place with one initial bit set.
    ///
    /// # Safety
    /// `mem` must point at a word-aligned slot of at least
    /// `size_in_bytes(size_in_bits)` bytes.
    pub unsafe fn init_at(
        mem: *mut u8,
        first_card_offset: u32,
        size_in_bits: u32,
    ) -> &'static CardSetBitmap {
        let bitmap = &*(mem as *const CardSetBitmap);
        bitmap.header.init();
        bitmap.num_bits_set.store(1, Ordering::Relaxed);
        let num_words = bitmap_bits_to_bytes(size_in_bits as usize) / BYTES_IN_WORD;
        for word in 0..num_words {
            bitmap.word(word).store(0, Ordering::Relaxed);
        }
        bitmap.word(first_card_offset as usize / BITS_IN_WORD).store(
            1 << (first_card_offset as usize % BITS_IN_WORD),
            Ordering::Relaxed,
        );
        bitmap
    }

    fn word(&self, index: usize) -> &AtomicUsize {
        unsafe {
            let base = (self as *const CardSetBitmap as *const u8)
                .add(std::mem::size_of::<CardSetBitmap>()) as *const AtomicUsize;
            &*base.add(index)
        }
    }

    pub fn num_bits_set(&self) -> u16 {
        self.num_bits_set.load(Ordering::Relaxed)
    }

    pub fn add(&self, card_offset: u32, threshold: u32, size_in_bits: u32) -> AddResult {
        debug_assert!(card_offset < size_in_bits);
        if self.num_bits_set() as u32 >= threshold {
            return if self.contains(card_offset, size_in_bits) {
                AddResult::Found
            } else {
                AddResult::Overflow
            };
        }
        let mask = 1usize << (card_offset as usize % BITS_IN_WORD);
        let old = self
            .word(card_offset as usize / BITS_IN_WORD)
            .fetch_or(mask, Ordering::Relaxed);
        if old & mask == 0 {
            self.num_bits_set.fetch_add(1, Ordering::Relaxed);
            AddResult::Added
        } else {
            AddResult::Found
        }
    }

    pub fn contains(&self, card_offset: u32, size_in_bits: u32) -> bool {
        debug_assert!(card_offset < size_in_bits);
        let word = self.word(card_offset as usize / BITS_IN_WORD).load(Ordering::Relaxed);
        word & (1usize << (card_offset as usize % BITS_IN_WORD)) != 0
    }

    pub fn iterate(&self, size_in_bits: u32, offset: u32, mut f: impl FnMut(u32)) {
        let num_words = bitmap_bits_to_bytes(size_in_bits as usize) / BYTES_IN_WORD;
        for word_index in 0..num_words {
            let mut word = self.word(word_index).load(Ordering::Relaxed);
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                f(offset | (word_index * BITS_IN_WORD + bit) as u32);
                word &= word - 1;
            }
        }
    }
}

// --- Howl container -------------------------------------------------------

/// A fixed fan-out of sub-containers, one atomic slot per bucket.
#[repr(C)]
pub struct CardSetHowl {
    header: ContainerHeader,
    /// Total cards in this howl. Initialized to the array capacity plus
    /// one: the howl is created when a full array overflows, and the card
    /// transfer does not increment the count.
    pub num_entries: AtomicU32,
}

impl CardSetHowl {
    pub fn size_in_bytes(num_buckets: u32) -> usize {
        std::mem::size_of::<CardSetHowl>() + num_buckets as usize * std::mem::size_of::<AtomicUsize>()
    }

    /// Construct in place, seeding the bucket of `card_in_region` with an
    /// inline container holding that card.
    ///
    /// # Safety
    /// `mem` must point at a word-aligned slot of at least
    /// `size_in_bytes(config.num_buckets_in_howl())` bytes.
    pub unsafe fn init_at(
        mem: *mut u8,
        card_in_region: u32,
        config: &CardSetConfig,
    ) -> &'static CardSetHowl {
        let howl = &*(mem as *const CardSetHowl);
        howl.header.init();
        howl.num_entries
            .store(config.max_cards_in_array() + 1, Ordering::Relaxed);
        let target_bucket = config.howl_bucket_index(card_in_region);
        for index in 0..config.num_buckets_in_howl() {
            let bucket = howl.bucket(index);
            bucket.store(ContainerPtr::EMPTY_INLINE.as_raw(), Ordering::Relaxed);
            if index == target_bucket {
                let mut inline = InlinePtr::new(bucket, bucket.load(Ordering::Relaxed));
                let result = inline.add(
                    card_in_region,
                    config.inline_ptr_bits_per_card(),
                    config.max_cards_in_inline_ptr(),
                );
                debug_assert_eq!(result, AddResult::Added);
            }
        }
        howl
    }

    pub fn bucket(&self, index: u32) -> &AtomicUsize {
        unsafe {
            let base = (self as *const CardSetHowl as *const u8)
                .add(std::mem::size_of::<CardSetHowl>()) as *const AtomicUsize;
            &*base.add(index as usize)
        }
    }

    pub fn contains(&self, card_in_region: u32, config: &CardSetConfig) -> bool {
        let bucket = self.bucket(config.howl_bucket_index(card_in_region));
        let container = ContainerPtr::from_raw(bucket.load(Ordering::Acquire));
        match container.tag() {
            ContainerTag::Inline => inline_contains(
                container.as_raw(),
                card_in_region,
                config.inline_ptr_bits_per_card(),
            ),
            ContainerTag::Array => unsafe {
                container.deref::<CardSetArray>().contains(card_in_region)
            },
            ContainerTag::Bitmap => unsafe {
                container.deref::<CardSetBitmap>().contains(
                    config.howl_bitmap_offset(card_in_region),
                    config.max_cards_in_howl_bitmap(),
                )
            },
            ContainerTag::Howl => {
                debug_assert!(container.is_full());
                true
            }
        }
    }

    pub fn iterate<V: CardOrRangeVisitor>(&self, config: &CardSetConfig, visitor: &mut V) {
        for index in 0..config.num_buckets_in_howl() {
            let container = ContainerPtr::from_raw(self.bucket(index).load(Ordering::Acquire));
            Self::iterate_bucket(container, index, config, visitor);
        }
    }

    fn iterate_bucket<V: CardOrRangeVisitor>(
        container: ContainerPtr,
        index: u32,
        config: &CardSetConfig,
        visitor: &mut V,
    ) {
        let offset = index << config.log2_max_cards_in_howl_bitmap();
        match container.tag() {
            ContainerTag::Inline => {
                if visitor.start_iterate(IterateTag::Inline) {
                    inline_iterate(container.as_raw(), config.inline_ptr_bits_per_card(), |card| {
                        visitor.do_card(card)
                    });
                }
            }
            ContainerTag::Array => {
                if visitor.start_iterate(IterateTag::Array) {
                    unsafe { container.deref::<CardSetArray>() }.iterate(|card| visitor.do_card(card));
                }
            }
            ContainerTag::Bitmap => {
                if visitor.start_iterate(IterateTag::Bitmap) {
                    unsafe { container.deref::<CardSetBitmap>() }.iterate(
                        config.max_cards_in_howl_bitmap(),
                        offset,
                        |card| visitor.do_card(card),
                    );
                }
            }
            ContainerTag::Howl => {
                debug_assert!(container.is_full());
                if visitor.start_iterate(IterateTag::Full) {
                    visitor.do_card_range(offset, config.max_cards_in_howl_bitmap());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardset::config;

    fn backing(bytes: usize) -> Vec<usize> {
        vec![0usize; bytes.div_ceil(BYTES_IN_WORD)]
    }

    #[test]
    fn tagged_pointer_round_trip() {
        let slot = 0x7f00_1230usize as *mut u8;
        let ptr = ContainerPtr::make(slot, ContainerTag::Bitmap);
        assert_eq!(ptr.tag(), ContainerTag::Bitmap);
        assert_eq!(ptr.strip(), slot);
        assert!(ContainerPtr::FULL.is_full());
        assert_eq!(ContainerPtr::FULL.tag(), ContainerTag::Howl);
        assert_eq!(ContainerPtr::EMPTY_INLINE.tag(), ContainerTag::Inline);
    }

    #[test]
    fn refcount_protocol() {
        let mut mem = backing(std::mem::size_of::<ContainerHeader>());
        let header = unsafe { &*(mem.as_mut_ptr() as *const ContainerHeader) };
        header.init();
        assert_eq!(header.refcount(), 3);
        assert!(header.try_increment_refcount());
        assert_eq!(header.refcount(), 5);
        assert_eq!(header.decrement_refcount(), 3);
        assert_eq!(header.decrement_refcount(), 1);
        // Tombstoned: cannot revive.
        assert!(!header.try_increment_refcount());
    }

    #[test]
    fn inline_add_find_iterate() {
        let slot = AtomicUsize::new(ContainerPtr::EMPTY_INLINE.as_raw());
        let bits = 11;
        let max = max_cards_in_inline_ptr(bits);
        assert_eq!(max, 5);

        for card in [5u32, 12, 77, 1020] {
            let mut ptr = InlinePtr::new(&slot, slot.load(Ordering::Relaxed));
            assert_eq!(ptr.add(card, bits, max), AddResult::Added);
        }
        let value = slot.load(Ordering::Relaxed);
        assert_eq!(inline_num_cards(value), 4);
        assert!(inline_contains(value, 77, bits));
        assert!(!inline_contains(value, 78, bits));

        let mut ptr = InlinePtr::new(&slot, value);
        assert_eq!(ptr.add(12, bits, max), AddResult::Found);

        let mut cards = Vec::new();
        inline_iterate(slot.load(Ordering::Relaxed), bits, |c| cards.push(c));
        cards.sort_unstable();
        assert_eq!(cards, vec![5, 12, 77, 1020]);
    }

    #[test]
    fn inline_overflows_at_capacity() {
        let slot = AtomicUsize::new(ContainerPtr::EMPTY_INLINE.as_raw());
        let bits = 11;
        let max = max_cards_in_inline_ptr(bits);
        for card in 0..max {
            let mut ptr = InlinePtr::new(&slot, slot.load(Ordering::Relaxed));
            assert_eq!(ptr.add(card, bits, max), AddResult::Added);
        }
        let mut ptr = InlinePtr::new(&slot, slot.load(Ordering::Relaxed));
        assert_eq!(ptr.add(max, bits, max), AddResult::Overflow);
    }

    #[test]
    fn array_add_until_overflow() {
        let capacity = 8;
        let mut mem = backing(CardSetArray::size_in_bytes(capacity));
        let array = unsafe { CardSetArray::init_at(mem.as_mut_ptr() as *mut u8, 100, capacity) };

        assert_eq!(array.num_entries(), 1);
        assert!(array.contains(100));
        assert_eq!(array.add(100), AddResult::Found);
        for card in 0..7u32 {
            assert_eq!(array.add(card), AddResult::Added);
        }
        assert_eq!(array.num_entries(), 8);
        assert_eq!(array.add(999), AddResult::Overflow);

        let mut cards = Vec::new();
        array.iterate(|c| cards.push(c));
        cards.sort_unstable();
        assert_eq!(cards, vec![0, 1, 2, 3, 4, 5, 6, 100]);
    }

    #[test]
    fn concurrent_array_adds_unique() {
        let capacity = 128;
        let mut mem = backing(CardSetArray::size_in_bytes(capacity));
        let array = unsafe { CardSetArray::init_at(mem.as_mut_ptr() as *mut u8, 0, capacity) };

        std::thread::scope(|scope| {
            for thread in 0..4 {
                scope.spawn(move || {
                    for i in 0..31u32 {
                        array.add(1 + thread * 31 + i);
                    }
                });
            }
        });
        assert_eq!(array.num_entries(), 125);
        for card in 0..125 {
            assert!(array.contains(card), "card {card} lost");
        }
    }

    #[test]
    fn bitmap_threshold_and_iteration() {
        let size_in_bits = 256;
        let threshold = 200;
        let mut mem = backing(CardSetBitmap::size_in_bytes(size_in_bits));
        let bitmap =
            unsafe { CardSetBitmap::init_at(mem.as_mut_ptr() as *mut u8, 3, size_in_bits) };

        assert_eq!(bitmap.num_bits_set(), 1);
        assert!(bitmap.contains(3, size_in_bits));
        assert_eq!(bitmap.add(3, threshold, size_in_bits), AddResult::Found);

        for card in 0..threshold {
            if card != 3 {
                assert_eq!(bitmap.add(card, threshold, size_in_bits), AddResult::Added);
            }
        }
        assert_eq!(bitmap.num_bits_set() as u32, threshold);
        // At the threshold: present cards still report Found, new cards
        // overflow.
        assert_eq!(bitmap.add(7, threshold, size_in_bits), AddResult::Found);
        assert_eq!(bitmap.add(threshold + 5, threshold, size_in_bits), AddResult::Overflow);

        let mut cards = Vec::new();
        bitmap.iterate(size_in_bits, 512, |c| cards.push(c));
        assert_eq!(cards.len(), threshold as usize);
        assert!(cards.iter().all(|&c| (512..512 + size_in_bits).contains(&c)));
    }

    #[test]
    fn howl_seeds_triggering_bucket() {
        let config = config::small_config();
        let mut mem = backing(CardSetHowl::size_in_bytes(config.num_buckets_in_howl()));
        let howl = unsafe { CardSetHowl::init_at(mem.as_mut_ptr() as *mut u8, 700, &config) };

        assert_eq!(
            howl.num_entries.load(Ordering::Relaxed),
            config.max_cards_in_array() + 1
        );
        assert!(howl.contains(700, &config));
        assert!(!howl.contains(701, &config));
        // Card 700 lives in bucket 2 (700 >> 8).
        let bucket = ContainerPtr::from_raw(howl.bucket(2).load(Ordering::Relaxed));
        assert_eq!(bucket.tag(), ContainerTag::Inline);
        assert_eq!(inline_num_cards(bucket.as_raw()), 1);
    }
}
