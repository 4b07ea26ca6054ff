//! Byte-per-card tables.
//!
//! Two structurally identical tables cover the heap: the card table
//! consulted by STW root scanning and the refinement table drained by
//! concurrent refinement. Which physical table plays which role swaps at
//! the start of every refinement cycle (see [`crate::refine::sweep`]).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::Address;

pub type CardValue = u8;

/// No work to do for this card. All ones so a word of clean cards is the
/// identity under the AND-merge of refinement words into card words.
pub const CLEAN_CARD: CardValue = 0xff;
/// Dirtied by a mutator write barrier. All zeroes: the zero of the
/// AND-merge, so a dirty refinement card wins over anything.
pub const DIRTY_CARD: CardValue = 0x00;
/// Marked while merging a remembered set container onto the card table.
pub const FROM_REMSET_CARD: CardValue = 0x01;
/// Refinement found this card to hold a reference into the collection set.
pub const TO_CSET_CARD: CardValue = 0x02;
/// Already scanned by an earlier evacuation increment of this pause.
pub const SCANNED_CARD: CardValue = 0x04;

/// Bit clear on every value that still needs scanning (dirty, from_remset,
/// to_cset) and set on the ones that do not (clean, scanned).
pub const TO_SCAN_MASK: CardValue = 0x04;
/// `TO_SCAN_MASK` replicated into every byte of a word.
pub const EXPANDED_TO_SCAN_MASK: usize = usize::from_ne_bytes([TO_SCAN_MASK; BYTES_IN_WORD]);
/// A whole word of clean cards.
pub const WORD_ALL_CLEAN: usize = usize::MAX;

// The lattice depends on exactly this bit assignment.
const_assert!(CLEAN_CARD & TO_SCAN_MASK != 0);
const_assert!(SCANNED_CARD & TO_SCAN_MASK != 0);
const_assert!(DIRTY_CARD & TO_SCAN_MASK == 0);
const_assert!(FROM_REMSET_CARD & TO_SCAN_MASK == 0);
const_assert!(TO_CSET_CARD & TO_SCAN_MASK == 0);

/// Returns whether a card with this value must be scanned in this pass.
pub fn is_to_scan(value: CardValue) -> bool {
    value & TO_SCAN_MASK == 0
}

/// A byte-per-card table covering the whole heap.
///
/// Storage is word-granular so the sweep and merge paths can test and move
/// eight cards at a time; individual cards are accessed through atomic byte
/// views of the same memory.
pub struct CardTable {
    heap_base: Address,
    num_cards: usize,
    words: Box<[AtomicUsize]>,
}

impl CardTable {
    pub fn new(heap_base: Address, num_cards: usize) -> Self {
        assert!(
            num_cards % BYTES_IN_WORD == 0,
            "card count {num_cards} must be word aligned"
        );
        let words = (0..num_cards / BYTES_IN_WORD)
            .map(|_| AtomicUsize::new(WORD_ALL_CLEAN))
            .collect();
        CardTable {
            heap_base,
            num_cards,
            words,
        }
    }

    pub fn num_cards(&self) -> usize {
        self.num_cards
    }

    /// The card index covering `addr`.
    pub fn index_for(&self, addr: Address) -> usize {
        let index = (addr - self.heap_base) >> LOG_BYTES_IN_CARD;
        debug_assert!(index < self.num_cards, "address {addr} outside covered heap");
        index
    }

    /// The first heap address covered by card `index`.
    pub fn addr_for(&self, index: usize) -> Address {
        debug_assert!(index < self.num_cards);
        self.heap_base + (index << LOG_BYTES_IN_CARD)
    }

    fn byte(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.num_cards);
        // An atomic byte view of the word storage. The base pointer is word
        // aligned, and AtomicU8 has the same layout as u8.
        unsafe { &*(self.words.as_ptr() as *const AtomicU8).add(index) }
    }

    pub fn get(&self, index: usize) -> CardValue {
        self.byte(index).load(Ordering::Relaxed)
    }

    pub fn set(&self, index: usize, value: CardValue) {
        self.byte(index).store(value, Ordering::Relaxed);
    }

    pub fn is_clean(&self, index: usize) -> bool {
        self.get(index) == CLEAN_CARD
    }

    /// The mutator write barrier store.
    pub fn dirty_card_for(&self, addr: Address) {
        self.byte(self.index_for(addr))
            .store(DIRTY_CARD, Ordering::Relaxed);
    }

    /// Mark a card as coming from a remembered set, but only if it is still
    /// clean. Anything else (dirty, to_cset, scanned) already implies at
    /// least as much scanning obligation; in particular a card scanned by an
    /// earlier increment of this pause must not become scannable again.
    pub fn mark_clean_as_from_remset(&self, index: usize) -> bool {
        if self.get(index) == CLEAN_CARD {
            self.set(index, FROM_REMSET_CARD);
            return true;
        }
        false
    }

    /// Range variant of [`Self::mark_clean_as_from_remset`]. Returns the
    /// number of cards actually changed.
    pub fn mark_clean_range_as_from_remset(&self, start: usize, length: usize) -> usize {
        let mut changed = 0;
        for index in start..start + length {
            if self.mark_clean_as_from_remset(index) {
                changed += 1;
            }
        }
        changed
    }

    /// Rewrite every card in `[start, end)` to `value`, returning how many
    /// of them were mutator-dirtied.
    pub fn change_dirty_cards_to(&self, start: usize, end: usize, value: CardValue) -> usize {
        let mut pending = 0;
        for index in start..end {
            if self.get(index) == DIRTY_CARD {
                pending += 1;
            }
            self.set(index, value);
        }
        pending
    }

    /// Reset `[start, end)` to clean. Both bounds must be word aligned.
    pub fn clear_range(&self, start: usize, end: usize) {
        debug_assert!(start % BYTES_IN_WORD == 0 && end % BYTES_IN_WORD == 0);
        for word in start / BYTES_IN_WORD..end / BYTES_IN_WORD {
            self.words[word].store(WORD_ALL_CLEAN, Ordering::Relaxed);
        }
    }

    /// Atomically take one word (eight cards) of this table, leaving it all
    /// clean. Used when folding leftover refinement cards into the card
    /// table.
    pub fn take_word(&self, word_index: usize) -> usize {
        self.words[word_index].swap(WORD_ALL_CLEAN, Ordering::Relaxed)
    }

    /// AND `value` into one word of this table.
    pub fn merge_word(&self, word_index: usize, value: usize) {
        if value != WORD_ALL_CLEAN {
            self.words[word_index].fetch_and(value, Ordering::Relaxed);
        }
    }

    pub fn is_range_clean(&self, start: usize, end: usize) -> bool {
        (start..end).all(|index| self.is_clean(index))
    }
}

/// Finds runs of to-scan cards within `[start, end)` of a table, testing a
/// word of cards at a time.
pub struct ChunkScanner<'a> {
    table: &'a CardTable,
    start: usize,
    end: usize,
}

impl<'a> ChunkScanner<'a> {
    pub fn new(table: &'a CardTable, start: usize, end: usize) -> Self {
        debug_assert!(start % BYTES_IN_WORD == 0, "chunk start must be word aligned");
        debug_assert!(end % BYTES_IN_WORD == 0, "chunk end must be word aligned");
        debug_assert!(start <= end && end <= table.num_cards());
        ChunkScanner { table, start, end }
    }

    fn find_first_to_scan(&self, mut index: usize) -> usize {
        while index < self.end && index % BYTES_IN_WORD != 0 {
            if is_to_scan(self.table.get(index)) {
                return index;
            }
            index += 1;
        }
        while index < self.end {
            let word = self.table.words[index / BYTES_IN_WORD].load(Ordering::Relaxed);
            if !word & EXPANDED_TO_SCAN_MASK != 0 {
                for offset in 0..BYTES_IN_WORD {
                    if is_to_scan(self.table.get(index + offset)) {
                        return index + offset;
                    }
                }
                unreachable!("word claimed to contain a to-scan card");
            }
            index += BYTES_IN_WORD;
        }
        self.end
    }

    fn find_first_not_to_scan(&self, mut index: usize) -> usize {
        while index < self.end && index % BYTES_IN_WORD != 0 {
            if !is_to_scan(self.table.get(index)) {
                return index;
            }
            index += 1;
        }
        while index < self.end {
            let word = self.table.words[index / BYTES_IN_WORD].load(Ordering::Relaxed);
            if word & EXPANDED_TO_SCAN_MASK != 0 {
                for offset in 0..BYTES_IN_WORD {
                    if !is_to_scan(self.table.get(index + offset)) {
                        return index + offset;
                    }
                }
                unreachable!("word claimed to contain a not-to-scan card");
            }
            index += BYTES_IN_WORD;
        }
        self.end
    }

    /// Invoke `f(run_start, run_end)` for every maximal run of to-scan
    /// cards in the chunk.
    pub fn on_to_scan_cards(&self, mut f: impl FnMut(usize, usize)) {
        let mut cursor = self.start;
        while cursor < self.end {
            let run_start = self.find_first_to_scan(cursor);
            if run_start == self.end {
                return;
            }
            let run_end = self.find_first_not_to_scan(run_start);
            f(run_start, run_end);
            cursor = run_end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(num_cards: usize) -> CardTable {
        CardTable::new(Address::from_usize(0x1000_0000), num_cards)
    }

    #[test]
    fn new_table_is_clean() {
        let ct = table(64);
        assert!(ct.is_range_clean(0, 64));
    }

    #[test]
    fn barrier_dirties_covering_card() {
        let ct = table(64);
        let addr = Address::from_usize(0x1000_0000) + 5 * BYTES_IN_CARD + 17;
        ct.dirty_card_for(addr);
        assert_eq!(ct.get(5), DIRTY_CARD);
        assert!(ct.is_clean(4) && ct.is_clean(6));
    }

    #[test]
    fn from_remset_does_not_overwrite_scanned() {
        let ct = table(16);
        ct.set(3, SCANNED_CARD);
        assert!(!ct.mark_clean_as_from_remset(3));
        assert_eq!(ct.get(3), SCANNED_CARD);
        assert!(ct.mark_clean_as_from_remset(4));
        assert_eq!(ct.get(4), FROM_REMSET_CARD);
    }

    #[test]
    fn chunk_scanner_finds_runs() {
        let ct = table(64);
        for index in 10..14 {
            ct.set(index, DIRTY_CARD);
        }
        ct.set(20, TO_CSET_CARD);
        ct.set(21, SCANNED_CARD); // breaks the run, not to-scan
        ct.set(22, FROM_REMSET_CARD);

        let mut runs = Vec::new();
        ChunkScanner::new(&ct, 0, 64).on_to_scan_cards(|l, r| runs.push((l, r)));
        assert_eq!(runs, vec![(10, 14), (20, 21), (22, 23)]);
    }

    #[test]
    fn change_dirty_counts_only_mutator_cards() {
        let ct = table(16);
        ct.set(1, DIRTY_CARD);
        ct.set(2, FROM_REMSET_CARD);
        ct.set(3, TO_CSET_CARD);
        let pending = ct.change_dirty_cards_to(0, 8, SCANNED_CARD);
        assert_eq!(pending, 1);
        for index in 0..8 {
            assert_eq!(ct.get(index), SCANNED_CARD);
        }
    }

    #[test]
    fn take_and_merge_words() {
        let rt = table(16);
        let ct = table(16);
        rt.set(1, DIRTY_CARD);
        ct.set(2, SCANNED_CARD);
        let word = rt.take_word(0);
        assert!(rt.is_range_clean(0, 8));
        ct.merge_word(0, word);
        // Dirty (all zero) wins over clean; clean is the identity.
        assert_eq!(ct.get(1), DIRTY_CARD);
        assert_eq!(ct.get(2), SCANNED_CARD);
        assert!(ct.is_clean(0));
    }
}
