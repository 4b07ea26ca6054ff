//! Grace-period tracking for deferred reclamation.
//!
//! Readers of container pointers enter a critical section before loading a
//! container slot and trying to acquire a reference count (see
//! [`crate::cardset`]). Memory freed while any such reader may still hold a
//! stale pointer is not handed out again until every reader that was inside
//! a critical section at free time has left it. This module provides that
//! ordering: a global generation counter, a per-thread pin slot, and a
//! query the arenas use to decide whether a deferred free-list entry has
//! drained its grace period.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Epoch value meaning "this thread is not inside a critical section".
const UNPINNED: u64 = 0;

/// The global generation counter. Starts at 1 so that `UNPINNED` is never a
/// valid epoch.
static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);

struct ReaderSlot {
    pinned: AtomicU64,
}

lazy_static! {
    static ref READERS: Mutex<Vec<Arc<ReaderSlot>>> = Mutex::new(Vec::new());
}

thread_local! {
    static LOCAL_READER: Arc<ReaderSlot> = {
        let slot = Arc::new(ReaderSlot { pinned: AtomicU64::new(UNPINNED) });
        READERS.lock().unwrap().push(slot.clone());
        slot
    };
    static CS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// An RAII critical section. While any thread holds one, memory freed at an
/// epoch at or after the pin is not reused.
///
/// Critical sections nest; only the outermost one pins and unpins.
pub struct CriticalSection {
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Enter a reader critical section.
pub fn critical_section() -> CriticalSection {
    CS_DEPTH.with(|depth| {
        if depth.get() == 0 {
            LOCAL_READER.with(|slot| {
                let epoch = GLOBAL_EPOCH.load(Ordering::Relaxed);
                slot.pinned.store(epoch, Ordering::Relaxed);
                // The pin must be visible before any subsequent container
                // slot load on this thread.
                std::sync::atomic::fence(Ordering::SeqCst);
            });
        }
        depth.set(depth.get() + 1);
    });
    CriticalSection {
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        CS_DEPTH.with(|depth| {
            let d = depth.get();
            debug_assert!(d > 0, "unbalanced critical section");
            depth.set(d - 1);
            if d == 1 {
                LOCAL_READER.with(|slot| {
                    slot.pinned.store(UNPINNED, Ordering::Release);
                });
            }
        });
    }
}

/// Advance the global epoch and return the value current before the bump.
/// Freed memory is stamped with this value.
pub fn advance() -> u64 {
    GLOBAL_EPOCH.fetch_add(1, Ordering::SeqCst)
}

/// Returns true when no reader is still pinned at or before `free_epoch`,
/// i.e. the grace period for memory freed at that epoch has closed.
pub fn safe_to_reuse(free_epoch: u64) -> bool {
    std::sync::atomic::fence(Ordering::SeqCst);
    let readers = READERS.lock().unwrap();
    for slot in readers.iter() {
        let pinned = slot.pinned.load(Ordering::Acquire);
        if pinned != UNPINNED && pinned <= free_epoch {
            return false;
        }
    }
    true
}
