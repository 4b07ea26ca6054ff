//! Concurrent refinement control.
//!
//! Mutators produce dirty cards; a pause-time budget covers processing
//! whatever is still pending when a GC starts. Refinement's job is to keep
//! the number of pending cards at GC start near a target derived from that
//! budget. A single control thread wakes periodically, recalculates how
//! many worker threads are needed to meet the target by the predicted next
//! GC, and drives the sweep state machine with that many workers.

pub mod stats;
pub mod sweep;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::heap::Heap;
use crate::policy::Policy;
use crate::scheduler::WorkerThreads;
use crate::util::options::Options;

use stats::RefineStats;
use sweep::SweepState;

/// Sentinel: no pending-cards target has been established yet. Until the
/// first post-GC adjustment the control thread sleeps indefinitely.
const PENDING_CARDS_TARGET_UNINITIALIZED: usize = usize::MAX;

/// Period between thread-count adjustments. A prime close to 50ms so the
/// wakeup does not align with other components deriving their periods from
/// the same predictions.
const ADJUST_THREADS_PERIOD_MS: u64 = 53;

#[derive(Default)]
struct ControlFlags {
    activated: bool,
    should_stop: bool,
}

struct ControlSync {
    flags: Mutex<ControlFlags>,
    wakeup: Condvar,
}

pub struct ConcurrentRefine {
    heap: Arc<Heap>,
    policy: Arc<dyn Policy>,
    options: Arc<Options>,

    sweep_state: SweepState,
    workers: WorkerThreads,

    num_threads_wanted: AtomicUsize,
    pending_cards_target: AtomicUsize,
    /// Cards already known pending for the next GC; fed by completed
    /// sweeps, reset by the pause.
    current_pending_cards: AtomicUsize,

    needs_adjust: AtomicBool,
    /// The heap lock could not be taken last time we tried to read the
    /// policy predictions; retry quickly.
    heap_was_locked: AtomicBool,
    last_adjust: spin::Mutex<Option<Instant>>,
    predicted_time_until_gc_ms: spin::Mutex<f64>,

    control: ControlSync,
    control_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ConcurrentRefine {
    /// Create the refinement machinery and start its control thread (when
    /// refinement is enabled).
    pub fn create(
        heap: Arc<Heap>,
        policy: Arc<dyn Policy>,
        options: Arc<Options>,
    ) -> Arc<ConcurrentRefine> {
        let max_workers = *options.conc_refinement_threads;
        let refine = Arc::new(ConcurrentRefine {
            sweep_state: SweepState::new(&heap),
            workers: WorkerThreads::new("refinement workers", max_workers.max(1)),
            heap,
            policy,
            options,
            num_threads_wanted: AtomicUsize::new(0),
            pending_cards_target: AtomicUsize::new(PENDING_CARDS_TARGET_UNINITIALIZED),
            current_pending_cards: AtomicUsize::new(0),
            needs_adjust: AtomicBool::new(false),
            heap_was_locked: AtomicBool::new(false),
            last_adjust: spin::Mutex::new(None),
            predicted_time_until_gc_ms: spin::Mutex::new(0.0),
            control: ControlSync {
                flags: Mutex::new(ControlFlags::default()),
                wakeup: Condvar::new(),
            },
            control_thread: Mutex::new(None),
        });

        if refine.is_refinement_enabled() {
            let for_thread = refine.clone();
            let handle = std::thread::Builder::new()
                .name("refinement control".into())
                .spawn(move || for_thread.run_control_loop())
                .expect("failed to start refinement control thread");
            *refine.control_thread.lock().unwrap() = Some(handle);
        }
        refine
    }

    pub fn is_refinement_enabled(&self) -> bool {
        *self.options.use_conc_refinement && *self.options.conc_refinement_threads > 0
    }

    pub fn sweep_state(&self) -> &SweepState {
        &self.sweep_state
    }

    pub fn workers(&self) -> &WorkerThreads {
        &self.workers
    }

    pub fn num_threads_wanted(&self) -> usize {
        self.num_threads_wanted.load(Ordering::Relaxed)
    }

    pub fn pending_cards_target(&self) -> usize {
        self.pending_cards_target.load(Ordering::Relaxed)
    }

    fn is_pending_cards_target_initialized(&self) -> bool {
        self.pending_cards_target() != PENDING_CARDS_TARGET_UNINITIALIZED
    }

    pub fn current_pending_cards(&self) -> usize {
        self.current_pending_cards.load(Ordering::Relaxed)
    }

    /// Pause-end bookkeeping: the pending cards were consumed.
    pub fn reset_pending_cards(&self) {
        self.current_pending_cards.store(0, Ordering::Relaxed);
    }

    /// Hand the sweep state to the STW merge: finish any in-flight cycle;
    /// if it never got to a snapshot, build one right now covering every
    /// non-free region.
    pub fn sweep_state_for_merge(&self) -> &SweepState {
        let has_sweep_claims = self.sweep_state.complete_work(false);
        if has_sweep_claims {
            debug!("continue existing refinement work");
        } else {
            // Refinement was interrupted without a snapshot. Threads may
            // hold a mix of swapped and unswapped card tables, so
            // conservatively sweep every non-free region's table.
            debug!("create refinement work from scratch");
            self.sweep_state.snapshot_heap(&self.heap, false);
        }
        &self.sweep_state
    }

    /// A region freed during a pause has nothing left to sweep.
    pub fn notify_region_reclaimed(&self, region_idx: u32) {
        if self.sweep_state.is_in_progress() {
            self.sweep_state.sweep_table().claim_all_cards(region_idx as usize);
        }
    }

    // --- Pending cards target ---------------------------------------------

    fn minimum_pending_cards_target(&self) -> usize {
        *self.options.parallel_gc_threads * *self.options.per_thread_pending_card_threshold
    }

    fn update_pending_cards_target(
        &self,
        pending_cards_time_ms: f64,
        processed_pending_cards: usize,
        goal_ms: f64,
    ) {
        let minimum = self.minimum_pending_cards_target();
        if processed_pending_cards < minimum || pending_cards_time_ms == 0.0 {
            debug!(
                "unchanged pending cards target: {} (processed {} minimum {} time {:.2})",
                self.pending_cards_target(),
                processed_pending_cards,
                minimum,
                pending_cards_time_ms
            );
            return;
        }

        // Base the budget on the measured processing rate.
        let rate = processed_pending_cards as f64 / pending_cards_time_ms;
        let mut new_target = (goal_ms * rate) as usize;
        // Hysteresis with the previous target.
        if self.is_pending_cards_target_initialized() {
            new_target = (new_target + self.pending_cards_target()) / 2;
        }
        new_target = new_target.max(minimum);
        self.pending_cards_target.store(new_target, Ordering::Relaxed);
        debug!("new pending cards target: {new_target}");
    }

    /// Called at the end of every pause: update the pending cards target
    /// from what the pause actually measured and wake the control thread.
    pub fn adjust_after_gc(
        &self,
        pending_cards_time_ms: f64,
        processed_pending_cards: usize,
        goal_ms: f64,
    ) {
        if !*self.options.use_conc_refinement {
            return;
        }
        self.update_pending_cards_target(pending_cards_time_ms, processed_pending_cards, goal_ms);
        if self.is_refinement_enabled() {
            self.needs_adjust.store(true, Ordering::Relaxed);
            if self.is_pending_cards_target_initialized() {
                self.activate();
            }
        }
    }

    // --- Thread count adjustment ------------------------------------------

    fn adjust_threads_wanted(&self, available_bytes: usize) {
        let alloc_rate = self.policy.predict_alloc_rate_ms().max(f64::MIN_POSITIVE);
        let time_until_gc_ms = (available_bytes as f64 / alloc_rate).max(1.0);
        *self.predicted_time_until_gc_ms.lock() = time_until_gc_ms;

        let pending = self.current_pending_cards();
        let dirtying_rate = self.policy.predict_dirtied_cards_rate_ms();
        let predicted_cards = pending as f64 + dirtying_rate * time_until_gc_ms;

        let target = self.pending_cards_target();
        let refine_rate = self
            .policy
            .predict_concurrent_refine_rate_ms()
            .max(f64::MIN_POSITIVE);

        let excess = predicted_cards - target as f64;
        let mut wanted = if excess <= 0.0 {
            0
        } else {
            (excess / (refine_rate * time_until_gc_ms)).ceil() as usize
        };
        wanted = wanted.min(*self.options.conc_refinement_threads);
        self.num_threads_wanted.store(wanted, Ordering::Relaxed);

        debug!(
            "concurrent refinement: wanted {}, pending cards: {}, predicted: {:.0}, goal {}, \
             time-until-next-gc: {:.2}ms refine-rate {:.2}c/ms dirtying-rate {:.2}c/ms",
            wanted, pending, predicted_cards, target, time_until_gc_ms, refine_rate, dirtying_rate
        );
    }

    /// Recalculate the wanted worker count. Returns true when refinement
    /// workers should be started now.
    pub fn adjust_num_threads_periodically(&self) -> bool {
        self.heap_was_locked.store(false, Ordering::Relaxed);

        // Without an explicit request, only adjust once per period; we may
        // have woken up spuriously.
        if !self.needs_adjust.load(Ordering::Relaxed) {
            let since_adjust = self.last_adjust.lock().map(|at| at.elapsed());
            if let Some(elapsed) = since_adjust {
                if elapsed.as_millis() < ADJUST_THREADS_PERIOD_MS as u128 {
                    self.num_threads_wanted.store(0, Ordering::Relaxed);
                    return false;
                }
            }
        }

        self.needs_adjust.store(false, Ordering::Relaxed);
        match self.policy.try_get_available_bytes_estimate() {
            Some(available_bytes) => {
                self.adjust_threads_wanted(available_bytes);
                *self.last_adjust.lock() = Some(Instant::now());
            }
            None => {
                self.heap_was_locked.store(true, Ordering::Relaxed);
                // Defer the adjustment to the (short) next wait.
                self.needs_adjust.store(true, Ordering::Relaxed);
            }
        }

        self.num_threads_wanted() > 0 && !self.heap_was_locked.load(Ordering::Relaxed)
    }

    /// How long the control thread sleeps when inactive. Zero means "wait
    /// until explicitly activated".
    pub fn adjust_threads_wait_ms(&self) -> u64 {
        if !self.is_pending_cards_target_initialized() {
            // No target yet: nothing useful to do until the first pause
            // establishes one.
            return 0;
        }
        if self.heap_was_locked.load(Ordering::Relaxed) {
            // Retry quickly; the prediction was unavailable, not wrong.
            return 1;
        }
        let available_time_ms = *self.predicted_time_until_gc_ms.lock();
        ((available_time_ms.sqrt() * 4.0) as u64).max(1).min(ADJUST_THREADS_PERIOD_MS)
    }

    // --- Control thread ---------------------------------------------------

    fn activate(&self) {
        let mut flags = self.control.flags.lock().unwrap();
        flags.activated = true;
        self.control.wakeup.notify_one();
    }

    pub fn stop(&self) {
        {
            let mut flags = self.control.flags.lock().unwrap();
            flags.should_stop = true;
            self.control.wakeup.notify_one();
        }
        if let Some(handle) = self.control_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run_control_loop(&self) {
        loop {
            let wait_ms = self.adjust_threads_wait_ms();
            {
                let mut flags = self.control.flags.lock().unwrap();
                while !flags.activated && !flags.should_stop {
                    if wait_ms == 0 {
                        flags = self.control.wakeup.wait(flags).unwrap();
                    } else {
                        let (guard, timeout) = self
                            .control
                            .wakeup
                            .wait_timeout(flags, Duration::from_millis(wait_ms))
                            .unwrap();
                        flags = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                }
                if flags.should_stop {
                    return;
                }
                flags.activated = false;
            }

            if self.adjust_num_threads_periodically() {
                self.run_refinement_cycle();
            }
        }
    }

    /// Drive one full sweep, yielding to safepoints between steps. Any
    /// state check failing means a GC cancelled the cycle.
    fn run_refinement_cycle(&self) {
        let state = &self.sweep_state;
        let heap = &self.heap;

        state.start_work();
        if !state.swap_global_card_table(heap) {
            return;
        }
        if !state.swap_java_threads_ct(heap) {
            return;
        }
        if !state.synchronize_gc_threads() {
            return;
        }
        if state.state() != sweep::RefineState::SnapshotHeap {
            return;
        }
        state.snapshot_heap(heap, true);

        if state.state() != sweep::RefineState::SweepRT {
            return;
        }
        state.sweep_refinement_table_start();
        loop {
            if state.state() != sweep::RefineState::SweepRT {
                return;
            }
            let completed =
                state.sweep_refinement_table_step(heap, &self.workers, self.num_threads_wanted());
            if completed {
                break;
            }
            // Yield requested: wait out the safepoint before resuming.
            std::thread::sleep(Duration::from_millis(1));
        }

        if state.state() == sweep::RefineState::CompleteRefineWork {
            let pending = state.stats().cards_pending();
            self.current_pending_cards.fetch_add(pending, Ordering::Relaxed);
            state.complete_work(true);
        }
    }

    pub fn stats(&self) -> RefineStats {
        self.sweep_state.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::test_support::test_heap_with_scanner;
    use crate::policy::FixedRatePolicy;

    fn refine_without_control_thread(policy: FixedRatePolicy) -> Arc<ConcurrentRefine> {
        let (heap, _) = test_heap_with_scanner();
        let mut options = Options::new();
        options.set_from_str("parallel_gc_threads", "2");
        options.set_from_str("per_thread_pending_card_threshold", "100");
        // Keep the control thread out of unit tests.
        options.set_from_str("use_conc_refinement", "false");
        let mut refine =
            ConcurrentRefine::create(Arc::new(heap), Arc::new(policy), Arc::new(options));
        assert!(Arc::get_mut(&mut refine).is_some(), "no control thread expected");
        refine
    }

    #[test]
    fn pending_cards_target_initialization_and_hysteresis() {
        let refine = refine_without_control_thread(FixedRatePolicy::default());
        assert!(!refine.is_pending_cards_target_initialized());

        // Too few processed cards: unchanged.
        refine.update_pending_cards_target(1.0, 10, 10.0);
        assert!(!refine.is_pending_cards_target_initialized());

        // 100k cards in 10ms -> 10k cards/ms; 2ms goal -> 20k target.
        refine.update_pending_cards_target(10.0, 100_000, 2.0);
        assert_eq!(refine.pending_cards_target(), 20_000);

        // Hysteresis: averaged with the previous target.
        refine.update_pending_cards_target(10.0, 100_000, 4.0);
        assert_eq!(refine.pending_cards_target(), (40_000 + 20_000) / 2);
    }

    #[test]
    fn pending_cards_target_floor() {
        let refine = refine_without_control_thread(FixedRatePolicy::default());
        // Rate yields a tiny target; the per-thread floor wins
        // (2 threads * 100 cards).
        refine.update_pending_cards_target(10.0, 1_000, 0.001);
        assert_eq!(refine.pending_cards_target(), 200);
    }

    #[test]
    fn threads_needed_scales_with_excess_cards() {
        let policy = FixedRatePolicy {
            alloc_rate: 1024.0 * 1024.0, // 1M/ms
            dirtying_rate: 1000.0,
            refine_rate: 100.0,
            available_bytes: 100 << 20, // 100ms until GC
            ..Default::default()
        };
        let refine = refine_without_control_thread(policy);
        refine.pending_cards_target.store(10_000, Ordering::Relaxed);

        // predicted = 0 + 1000 * 100 = 100k cards; excess 90k;
        // each thread refines 100 * 100 = 10k cards by GC -> 9 threads,
        // clamped to the configured maximum.
        refine.adjust_threads_wanted(100 << 20);
        let expected = 9.min(*refine.options.conc_refinement_threads);
        assert_eq!(refine.num_threads_wanted(), expected);

        // Nothing wanted when the target comfortably covers predictions.
        refine.pending_cards_target.store(1_000_000, Ordering::Relaxed);
        refine.adjust_threads_wanted(100 << 20);
        assert_eq!(refine.num_threads_wanted(), 0);
    }

    #[test]
    fn wait_time_is_bounded() {
        let refine = refine_without_control_thread(FixedRatePolicy::default());
        // Uninitialized target: sleep forever.
        assert_eq!(refine.adjust_threads_wait_ms(), 0);

        refine.pending_cards_target.store(1000, Ordering::Relaxed);
        *refine.predicted_time_until_gc_ms.lock() = 25.0;
        // sqrt(25) * 4 = 20ms.
        assert_eq!(refine.adjust_threads_wait_ms(), 20);

        *refine.predicted_time_until_gc_ms.lock() = 1_000_000.0;
        assert_eq!(refine.adjust_threads_wait_ms(), ADJUST_THREADS_PERIOD_MS);

        refine.heap_was_locked.store(true, Ordering::Relaxed);
        assert_eq!(refine.adjust_threads_wait_ms(), 1);
    }

    #[test]
    fn heap_lock_defers_adjustment() {
        struct LockedPolicy;
        impl crate::policy::Policy for LockedPolicy {
            fn predict_card_merge_time_ms(&self, _: usize) -> f64 { 0.0 }
            fn predict_card_scan_time_ms(&self, _: usize) -> f64 { 0.0 }
            fn predict_young_region_other_time_ms(&self, _: usize) -> f64 { 0.0 }
            fn predict_eden_copy_time_ms(&self, _: usize) -> f64 { 0.0 }
            fn predict_region_total_time_ms(&self, _: &crate::heap::Region, _: bool) -> f64 { 0.0 }
            fn predict_alloc_rate_ms(&self) -> f64 { 1.0 }
            fn predict_dirtied_cards_rate_ms(&self) -> f64 { 1.0 }
            fn predict_concurrent_refine_rate_ms(&self) -> f64 { 1.0 }
            fn try_get_available_bytes_estimate(&self) -> Option<usize> { None }
        }

        let (heap, _) = test_heap_with_scanner();
        let mut options = Options::new();
        options.set_from_str("use_conc_refinement", "false");
        let refine = ConcurrentRefine::create(
            Arc::new(heap),
            Arc::new(LockedPolicy),
            Arc::new(options),
        );

        refine.needs_adjust.store(true, Ordering::Relaxed);
        assert!(!refine.adjust_num_threads_periodically());
        // Deferred, not dropped.
        assert!(refine.needs_adjust.load(Ordering::Relaxed));
        assert!(refine.heap_was_locked.load(Ordering::Relaxed));
    }
}
