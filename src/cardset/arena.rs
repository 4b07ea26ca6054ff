//! Typed monotonic arenas for card set containers and hash table nodes.
//!
//! Each per-region card set owns one memory manager with an arena per
//! object kind. Arenas hand out fixed-size word-aligned slots from
//! geometrically growing chunks; freed slots go onto a per-arena free list
//! stamped with the reclamation epoch and are only handed out again once
//! the grace period for that epoch has closed (see [`crate::util::epoch`]).
//! `flush` drops all chunks wholesale and must only be called while no
//! concurrent reader can hold a container of this set (at a safepoint, or
//! before the region is visible).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::util::constants::*;
use crate::util::epoch;

use super::config::CardSetConfig;
use super::containers::{CardSetArray, CardSetBitmap, CardSetHowl};
use super::hash_table;

/// The arena-backed object kinds, one arena each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemObjectType {
    Node = 0,
    Array = 1,
    Bitmap = 2,
    Howl = 3,
}

pub const NUM_MEM_OBJECT_TYPES: usize = 4;

const MEM_OBJECT_TYPE_NAMES: [&str; NUM_MEM_OBJECT_TYPES] = ["Node", "Array", "Bitmap", "Howl"];

struct Chunk {
    ptr: *mut u8,
    capacity: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Chunk {
        let layout = Layout::from_size_align(capacity, BYTES_IN_WORD).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "arena chunk allocation of {capacity} bytes failed");
        Chunk { ptr, capacity }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, BYTES_IN_WORD).unwrap();
        unsafe { dealloc(self.ptr, layout) };
    }
}

struct ArenaChunks {
    chunks: Vec<Chunk>,
    /// Bytes handed out of the last chunk.
    cursor: usize,
    /// Slot count of the next chunk to allocate; doubles up to the cap.
    next_chunk_slots: usize,
}

/// A fixed-slot-size arena with a deferred-reuse free list.
pub struct Arena {
    name: &'static str,
    slot_bytes: usize,
    initial_chunk_slots: usize,
    max_chunk_slots: usize,
    chunks: Mutex<ArenaChunks>,
    free_list: Mutex<VecDeque<(usize, u64)>>,
    num_allocated: AtomicUsize,
}

// Slots are raw memory handed across threads; the arena itself is guarded
// by its locks and atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(name: &'static str, object_bytes: usize, initial_chunk_slots: usize, max_chunk_slots: usize) -> Arena {
        let slot_bytes = object_bytes.next_multiple_of(BYTES_IN_WORD);
        Arena {
            name,
            slot_bytes,
            initial_chunk_slots,
            max_chunk_slots,
            chunks: Mutex::new(ArenaChunks {
                chunks: Vec::new(),
                cursor: 0,
                next_chunk_slots: initial_chunk_slots,
            }),
            free_list: Mutex::new(VecDeque::new()),
            num_allocated: AtomicUsize::new(0),
        }
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Allocate one slot, preferring a free-list entry whose grace period
    /// has closed.
    pub fn allocate(&self) -> *mut u8 {
        if let Some(slot) = self.try_pop_free() {
            self.num_allocated.fetch_add(1, Ordering::Relaxed);
            return slot;
        }

        let mut chunks = self.chunks.lock();
        let needs_chunk = match chunks.chunks.last() {
            Some(chunk) => chunks.cursor + self.slot_bytes > chunk.capacity,
            None => true,
        };
        if needs_chunk {
            let slots = chunks.next_chunk_slots;
            chunks.next_chunk_slots = (slots * 2).min(self.max_chunk_slots);
            chunks.chunks.push(Chunk::new(slots * self.slot_bytes));
            chunks.cursor = 0;
        }
        let chunk = chunks.chunks.last().unwrap();
        let slot = unsafe { chunk.ptr.add(chunks.cursor) };
        chunks.cursor += self.slot_bytes;
        self.num_allocated.fetch_add(1, Ordering::Relaxed);
        slot
    }

    fn try_pop_free(&self) -> Option<*mut u8> {
        let mut free_list = self.free_list.lock();
        // Entries are queued in epoch order; the front is the oldest and
        // the first to drain its grace period.
        if let Some(&(slot, free_epoch)) = free_list.front() {
            if epoch::safe_to_reuse(free_epoch) {
                free_list.pop_front();
                return Some(slot as *mut u8);
            }
        }
        None
    }

    /// Return a slot to the free list. The memory stays unavailable until
    /// every reader currently inside a critical section has left.
    pub fn free(&self, slot: *mut u8) {
        let free_epoch = epoch::advance();
        self.free_list.lock().push_back((slot as usize, free_epoch));
        self.num_allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drop all chunks and forget the free list.
    ///
    /// The caller must guarantee no concurrent access to any object of
    /// this arena: used when the owning card set is cleared at a
    /// safepoint or torn down.
    pub fn flush(&self) {
        let mut chunks = self.chunks.lock();
        chunks.chunks.clear();
        chunks.cursor = 0;
        chunks.next_chunk_slots = self.initial_chunk_slots;
        self.free_list.lock().clear();
        self.num_allocated.store(0, Ordering::Relaxed);
    }

    pub fn num_allocated(&self) -> usize {
        self.num_allocated.load(Ordering::Relaxed)
    }

    /// Total bytes reserved by this arena.
    pub fn mem_size(&self) -> usize {
        self.chunks.lock().chunks.iter().map(|c| c.capacity).sum()
    }

    /// Bytes reserved but not currently handed out.
    pub fn unused_mem_size(&self) -> usize {
        self.mem_size() - self.num_allocated() * self.slot_bytes
    }
}

/// Per-card-set memory manager: one arena per object kind.
pub struct MemoryManager {
    arenas: [Arena; NUM_MEM_OBJECT_TYPES],
}

impl MemoryManager {
    pub fn new(config: &CardSetConfig) -> MemoryManager {
        MemoryManager {
            arenas: [
                Arena::new(MEM_OBJECT_TYPE_NAMES[0], hash_table::node_size_in_bytes(), 8, 256),
                Arena::new(
                    MEM_OBJECT_TYPE_NAMES[1],
                    CardSetArray::size_in_bytes(config.max_cards_in_array()),
                    2,
                    256,
                ),
                Arena::new(
                    MEM_OBJECT_TYPE_NAMES[2],
                    CardSetBitmap::size_in_bytes(config.max_cards_in_howl_bitmap()),
                    2,
                    256,
                ),
                Arena::new(
                    MEM_OBJECT_TYPE_NAMES[3],
                    CardSetHowl::size_in_bytes(config.num_buckets_in_howl()),
                    2,
                    256,
                ),
            ],
        }
    }

    pub fn allocate(&self, kind: MemObjectType) -> *mut u8 {
        self.arenas[kind as usize].allocate()
    }

    pub fn free(&self, kind: MemObjectType, slot: *mut u8) {
        self.arenas[kind as usize].free(slot);
    }

    pub fn allocate_node(&self) -> *mut u8 {
        self.allocate(MemObjectType::Node)
    }

    pub fn free_node(&self, slot: *mut u8) {
        self.free(MemObjectType::Node, slot);
    }

    /// Release all memory of this manager. See [`Arena::flush`] for the
    /// exclusivity requirement.
    pub fn flush(&self) {
        for arena in &self.arenas {
            arena.flush();
        }
    }

    pub fn mem_size(&self) -> usize {
        self.arenas.iter().map(Arena::mem_size).sum()
    }

    pub fn unused_mem_size(&self) -> usize {
        self.arenas.iter().map(Arena::unused_mem_size).sum()
    }

    pub fn log_stats(&self) {
        for arena in &self.arenas {
            trace!(
                "arena {}: slot {}B allocated {} reserved {}B",
                arena.name,
                arena.slot_bytes(),
                arena.num_allocated(),
                arena.mem_size()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardset::config;

    fn test_arena() -> Arena {
        Arena::new("test", 24, 2, 16)
    }

    #[test]
    fn slots_are_aligned_and_distinct() {
        let arena = test_arena();
        let a = arena.allocate();
        let b = arena.allocate();
        let c = arena.allocate();
        assert_ne!(a, b);
        assert_ne!(b, c);
        for slot in [a, b, c] {
            assert_eq!(slot as usize % BYTES_IN_WORD, 0);
        }
        assert_eq!(arena.num_allocated(), 3);
    }

    /// Allocate until `slot` comes back. Readers from unrelated tests may
    /// briefly pin the epoch, so reuse is awaited rather than asserted on
    /// the first allocation.
    fn await_reuse(arena: &Arena, slot: *mut u8) -> bool {
        for _ in 0..100_000 {
            let p = arena.allocate();
            if p == slot {
                return true;
            }
            arena.free(p);
            std::thread::yield_now();
        }
        false
    }

    #[test]
    fn freed_slot_is_reused_after_grace_period() {
        let arena = test_arena();
        let slot = arena.allocate();
        arena.free(slot);
        assert!(await_reuse(&arena, slot));
    }

    #[test]
    fn pinned_reader_defers_reuse() {
        let arena = test_arena();
        let slot = arena.allocate();
        let cs = epoch::critical_section();
        arena.free(slot);
        let other = arena.allocate();
        assert_ne!(slot, other, "slot reused while a reader was pinned");
        drop(cs);
        assert!(await_reuse(&arena, slot));
    }

    #[test]
    fn flush_resets_everything() {
        let manager = MemoryManager::new(&config::small_config());
        for _ in 0..10 {
            manager.allocate(MemObjectType::Array);
        }
        assert!(manager.mem_size() > 0);
        manager.flush();
        assert_eq!(manager.mem_size(), 0);
        assert_eq!(manager.unused_mem_size(), 0);
    }

    #[test]
    fn chunks_grow_geometrically() {
        let arena = test_arena();
        // 2 + 4 + 8 slots fit in the first three chunks.
        for _ in 0..14 {
            arena.allocate();
        }
        assert_eq!(arena.chunks.lock().chunks.len(), 3);
    }
}
