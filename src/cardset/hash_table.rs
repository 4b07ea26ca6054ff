//! Concurrent hash table mapping card-region index to container.
//!
//! A chaining table with arena-allocated nodes. The hash is the identity
//! on the region index. Nodes are never unlinked individually; they are
//! reclaimed wholesale when the owning card set is cleared, which keeps
//! lock-free reads simple: a reader can always finish walking whatever
//! chain it started on.
//!
//! Growth doubles the bucket array. Every node carries two chain links,
//! one per table "parity": rehashing builds the new table's chains on the
//! other parity without disturbing the chains a concurrent reader may be
//! walking, then publishes the new array. Retired arrays are kept until
//! the next reset. Inserters hold a shared resize lock so an insert can
//! never land in an array that is being rehashed away; plain lookups take
//! no lock at all.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use super::arena::MemoryManager;
use super::containers::ContainerPtr;

/// Initial bucket count is `2^INITIAL_LOG_TABLE_SIZE`.
pub const INITIAL_LOG_TABLE_SIZE: usize = 2;

/// Grow when the average chain length would exceed this.
const GROW_LOAD_FACTOR: usize = 2;

/// One table entry: the per-card-region container and its occupancy.
#[repr(C)]
pub struct CardSetHashTableValue {
    region_idx: u32,
    /// Number of cards in this card region's container. A lower bound; see
    /// the coarsening discussion in [`crate::cardset`].
    pub num_occupied: AtomicUsize,
    /// The tagged container pointer ([`ContainerPtr`] raw value).
    pub container: AtomicUsize,
    next: [AtomicPtr<CardSetHashTableValue>; 2],
}

impl CardSetHashTableValue {
    pub fn region_idx(&self) -> u32 {
        self.region_idx
    }

    pub fn container_ptr(&self) -> ContainerPtr {
        ContainerPtr::from_raw(self.container.load(Ordering::Relaxed))
    }
}

pub fn node_size_in_bytes() -> usize {
    std::mem::size_of::<CardSetHashTableValue>()
}

struct BucketArray {
    parity: usize,
    buckets: Box<[AtomicPtr<CardSetHashTableValue>]>,
}

impl BucketArray {
    fn new(log_size: usize, parity: usize) -> Box<BucketArray> {
        let buckets = (0..1usize << log_size)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Box::new(BucketArray { parity, buckets })
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    fn bucket(&self, region_idx: u32) -> &AtomicPtr<CardSetHashTableValue> {
        // Identity hash.
        &self.buckets[region_idx as usize & self.mask()]
    }

    fn find(&self, region_idx: u32) -> Option<&CardSetHashTableValue> {
        let mut cursor = self.bucket(region_idx).load(Ordering::Acquire);
        while let Some(node) = unsafe { cursor.as_ref() } {
            if node.region_idx == region_idx {
                return Some(node);
            }
            cursor = node.next[self.parity].load(Ordering::Acquire);
        }
        None
    }
}

pub struct CardSetHashTable {
    current: AtomicPtr<BucketArray>,
    /// Shared by inserters, exclusive for grow and reset.
    resize: RwLock<()>,
    retired: Mutex<Vec<Box<BucketArray>>>,
    num_entries: AtomicUsize,
    inserted_card: AtomicBool,
}

// The raw node pointers are arena slots owned by the same card set.
unsafe impl Send for CardSetHashTable {}
unsafe impl Sync for CardSetHashTable {}

impl CardSetHashTable {
    pub fn new() -> CardSetHashTable {
        CardSetHashTable {
            current: AtomicPtr::new(Box::into_raw(BucketArray::new(INITIAL_LOG_TABLE_SIZE, 0))),
            resize: RwLock::new(()),
            retired: Mutex::new(Vec::new()),
            num_entries: AtomicUsize::new(0),
            inserted_card: AtomicBool::new(false),
        }
    }

    fn table(&self) -> &BucketArray {
        unsafe { &*self.current.load(Ordering::Acquire) }
    }

    pub fn get(&self, region_idx: u32) -> Option<&CardSetHashTableValue> {
        self.table().find(region_idx)
    }

    /// Find or insert the entry for `region_idx`. Sets `should_grow` when
    /// the load factor passed its threshold; the caller grows outside the
    /// insert path.
    pub fn get_or_add(
        &self,
        mm: &MemoryManager,
        region_idx: u32,
        should_grow: &mut bool,
    ) -> &CardSetHashTableValue {
        if let Some(found) = self.get(region_idx) {
            return found;
        }

        // Hold off concurrent rehashing while inserting.
        let _shared = self.resize.read();
        let table = self.table();

        let node = mm.allocate_node() as *mut CardSetHashTableValue;
        unsafe {
            (*node).region_idx = region_idx;
            (*node).num_occupied = AtomicUsize::new(0);
            (*node).container = AtomicUsize::new(ContainerPtr::EMPTY_INLINE.as_raw());
            (*node).next = [
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
            ];
        }

        let bucket = table.bucket(region_idx);
        let mut head = bucket.load(Ordering::Acquire);
        loop {
            // Someone may have inserted the region while we prepared.
            if let Some(found) = table.find(region_idx) {
                mm.free_node(node as *mut u8);
                return found;
            }
            unsafe { (*node).next[table.parity].store(head, Ordering::Relaxed) };
            match bucket.compare_exchange(head, node, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let entries = self.num_entries.fetch_add(1, Ordering::Relaxed) + 1;
        *should_grow = entries > GROW_LOAD_FACTOR * table.buckets.len();
        self.inserted_card.store(true, Ordering::Relaxed);
        unsafe { &*node }
    }

    /// Double the bucket array. Readers keep walking the old chains until
    /// the new array is published.
    pub fn grow(&self) {
        let _exclusive = self.resize.write();
        let old = self.table();
        let new_log_size = (old.buckets.len() << 1).ilog2() as usize;
        let new = BucketArray::new(new_log_size, 1 - old.parity);

        for bucket in old.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while let Some(node) = unsafe { cursor.as_ref() } {
                let target = new.bucket(node.region_idx);
                node.next[new.parity].store(target.load(Ordering::Relaxed), Ordering::Relaxed);
                target.store(cursor, Ordering::Relaxed);
                cursor = node.next[old.parity].load(Ordering::Acquire);
            }
        }

        let old_ptr = self
            .current
            .swap(Box::into_raw(new), Ordering::AcqRel);
        self.retired.lock().push(unsafe { Box::from_raw(old_ptr) });
        debug!("card set hash table grown to 2^{} buckets", new_log_size);
    }

    /// Drop every entry and shrink back to the initial size.
    ///
    /// Node memory is reclaimed by the owning memory manager's flush; the
    /// caller must guarantee no concurrent access (safepoint, or the set
    /// is otherwise private).
    pub fn reset(&self) {
        if !self.inserted_card.load(Ordering::Relaxed) {
            return;
        }
        let _exclusive = self.resize.write();
        let old_ptr = self.current.swap(
            Box::into_raw(BucketArray::new(INITIAL_LOG_TABLE_SIZE, 0)),
            Ordering::AcqRel,
        );
        drop(unsafe { Box::from_raw(old_ptr) });
        self.retired.lock().clear();
        self.num_entries.store(0, Ordering::Relaxed);
        self.inserted_card.store(false, Ordering::Relaxed);
    }

    /// Visit every entry. Safe concurrently with inserts (entries added
    /// during iteration may or may not be visited).
    pub fn iterate(&self, mut f: impl FnMut(&CardSetHashTableValue)) {
        let table = self.table();
        for bucket in table.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while let Some(node) = unsafe { cursor.as_ref() } {
                f(node);
                cursor = node.next[table.parity].load(Ordering::Acquire);
            }
        }
    }

    /// Safepoint-stable scan: the table is not concurrently modified, so
    /// the snapshot is exact.
    pub fn iterate_safepoint(&self, f: impl FnMut(&CardSetHashTableValue)) {
        self.iterate(f);
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn log_table_size(&self) -> usize {
        self.table().buckets.len().ilog2() as usize
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.table().buckets.len() * std::mem::size_of::<AtomicPtr<CardSetHashTableValue>>()
            + self.num_entries() * node_size_in_bytes()
    }
}

impl Drop for CardSetHashTable {
    fn drop(&mut self) {
        let old_ptr = self.current.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(old_ptr) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardset::arena::MemoryManager;
    use crate::cardset::config;

    #[test]
    fn get_or_add_finds_existing() {
        let mm = MemoryManager::new(&config::small_config());
        let table = CardSetHashTable::new();
        let mut should_grow = false;

        let first = table.get_or_add(&mm, 42, &mut should_grow) as *const _;
        let second = table.get_or_add(&mm, 42, &mut should_grow) as *const _;
        assert_eq!(first, second);
        assert_eq!(table.num_entries(), 1);
        assert!(table.get(42).is_some());
        assert!(table.get(43).is_none());
    }

    #[test]
    fn grow_preserves_entries() {
        let mm = MemoryManager::new(&config::small_config());
        let table = CardSetHashTable::new();
        let mut should_grow = false;
        for region in 0..64u32 {
            table.get_or_add(&mm, region, &mut should_grow);
            if should_grow {
                table.grow();
            }
        }
        assert!(table.log_table_size() > INITIAL_LOG_TABLE_SIZE);
        for region in 0..64u32 {
            assert!(table.get(region).is_some(), "region {region} lost by grow");
        }
        let mut seen = 0;
        table.iterate(|_| seen += 1);
        assert_eq!(seen, 64);
    }

    #[test]
    fn reset_empties_table() {
        let mm = MemoryManager::new(&config::small_config());
        let table = CardSetHashTable::new();
        let mut should_grow = false;
        for region in 0..10u32 {
            table.get_or_add(&mm, region, &mut should_grow);
        }
        table.reset();
        mm.flush();
        assert_eq!(table.num_entries(), 0);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn concurrent_insert_no_duplicates() {
        let mm = MemoryManager::new(&config::small_config());
        let table = CardSetHashTable::new();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut should_grow = false;
                    for region in 0..128u32 {
                        table.get_or_add(&mm, region, &mut should_grow);
                    }
                });
            }
        });

        assert_eq!(table.num_entries(), 128);
        let mut seen = std::collections::HashSet::new();
        table.iterate(|node| {
            assert!(seen.insert(node.region_idx()), "duplicate {}", node.region_idx());
        });
        assert_eq!(seen.len(), 128);
    }
}
