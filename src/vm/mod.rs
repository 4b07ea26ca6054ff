//! Runtime interop: mutator thread blocks, handshakes, GC-thread
//! rendezvous, and the yield flag concurrent workers poll.
//!
//! The embedding runtime owns real threads; this module models the pieces
//! of them the remembered set machinery touches. Each mutator carries an
//! atomic base pointer naming the card table its write barrier dirties. A
//! handshake re-points that base on every registered mutator; the
//! GC-thread rendezvous is a full fence executed while the worker pools
//! are quiescent, so workers that subsequently run observe both the table
//! swap and any stores made through the old table.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use crate::heap::CardTable;
use crate::util::Address;

/// Per-mutator-thread state. The embedding runtime keeps one of these in
/// each thread's TLS block; the write barrier reads `card_table_base` with
/// acquire semantics on every store.
pub struct MutatorThread {
    card_table_base: AtomicPtr<CardTable>,
}

impl MutatorThread {
    fn new(table: &CardTable) -> Self {
        MutatorThread {
            card_table_base: AtomicPtr::new(table as *const CardTable as *mut CardTable),
        }
    }

    /// The post-write barrier: dirty the card covering `addr` in whichever
    /// table this thread's base currently names.
    pub fn write_barrier(&self, addr: Address) {
        let table = self.card_table_base.load(Ordering::Acquire);
        // The heap owns both tables for its whole lifetime; the pointer is
        // re-aimed but never dangles.
        unsafe { &*table }.dirty_card_for(addr);
    }

    /// The handshake callback: install the new mutator-write table.
    fn set_card_table_base(&self, table: &CardTable) {
        self.card_table_base
            .store(table as *const CardTable as *mut CardTable, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn card_table_base_for_test(&self) -> *const CardTable {
        self.card_table_base.load(Ordering::Acquire)
    }
}

/// Registry of live mutator threads. The lock doubles as the thread-list
/// lock held while swapping the global card table pointer, so no thread can
/// register and cache a stale base concurrently with a swap.
pub struct MutatorRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        MutatorRegistry {
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register a new mutator, initializing its table base to the current
    /// mutator-write table. `current_table` is resolved while the
    /// thread-list lock is held: a concurrent table swap either happens
    /// before (the new thread reads the new table) or after (the handshake
    /// sees the new thread); it can never miss a registration.
    pub fn register<'t>(&self, current_table: impl FnOnce() -> &'t CardTable) -> Arc<MutatorThread> {
        let mut threads = self.threads.lock().unwrap();
        let mutator = Arc::new(MutatorThread::new(current_table()));
        threads.push(mutator.clone());
        mutator
    }

    /// Run `f` while holding the thread-list lock. Used by the global card
    /// table swap.
    pub fn with_threads_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.threads.lock().unwrap();
        f()
    }

    /// Execute a handshake: run the swap callback against every registered
    /// mutator. The per-thread base is atomic with release/acquire pairing,
    /// so running the callback here is equivalent to running it at each
    /// thread's next safepoint poll.
    pub fn handshake_swap_card_table(&self, new_table: &CardTable) {
        let threads = self.threads.lock().unwrap();
        for mutator in threads.iter() {
            mutator.set_card_table_base(new_table);
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.lock().unwrap().len()
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendezvous the GC worker threads: flush store ordering so that workers
/// running after this call observe the card table swap and every store made
/// through the old table. Worker pools in this crate are quiescent between
/// tasks, so a full fence is the entire rendezvous.
pub fn rendezvous_gc_threads() {
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// The flag a safepoint-bound VM thread raises to ask concurrent workers to
/// yield between work chunks.
pub struct YieldFlag {
    should_yield: AtomicBool,
}

impl YieldFlag {
    pub fn new() -> Self {
        YieldFlag {
            should_yield: AtomicBool::new(false),
        }
    }

    pub fn request(&self) {
        self.should_yield.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.should_yield.store(false, Ordering::Release);
    }

    pub fn should_yield(&self) -> bool {
        self.should_yield.load(Ordering::Acquire)
    }
}

impl Default for YieldFlag {
    fn default() -> Self {
        Self::new()
    }
}
