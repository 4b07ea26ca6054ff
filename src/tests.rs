//! End-to-end tests of the refine / merge / scan pipeline.

use std::sync::{Arc, Mutex};

use crate::gc::{EvacuationSink, HeapRemSet};
use crate::heap::card_table;
use crate::heap::test_support::{test_heap_with_scanner, MapScanner, TEST_HEAP_BASE};
use crate::heap::{Heap, RegionKind};
use crate::policy::FixedRatePolicy;
use crate::refine::sweep::RefineState;
use crate::refine::ConcurrentRefine;
use crate::scheduler::WorkerThreads;
use crate::util::constants::BYTES_IN_CARD;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::MutatorThread;

struct PauseEnv {
    heap: Arc<Heap>,
    scanner: Arc<MapScanner>,
    refine: Arc<ConcurrentRefine>,
    rem_set: HeapRemSet,
    workers: WorkerThreads,
    mutator: Arc<MutatorThread>,
}

fn pause_env() -> PauseEnv {
    let (heap, scanner) = test_heap_with_scanner();
    let heap = Arc::new(heap);
    let mut options = Options::new();
    options.set_from_str("parallel_gc_threads", "4");
    options.set_from_str("conc_refinement_threads", "2");
    // The tests drive the sweep machinery directly; no control thread.
    options.set_from_str("use_conc_refinement", "false");
    let options = Arc::new(options);
    let refine = ConcurrentRefine::create(
        heap.clone(),
        Arc::new(FixedRatePolicy::default()),
        options.clone(),
    );
    let rem_set = HeapRemSet::new(heap.clone(), refine.clone(), options);
    let mutator = heap.register_mutator();
    PauseEnv {
        scanner,
        refine,
        rem_set,
        workers: WorkerThreads::new("gc workers", 4),
        heap,
        mutator,
    }
}

fn addr(card: usize) -> Address {
    Address::from_usize(TEST_HEAP_BASE) + card * BYTES_IN_CARD
}

#[derive(Default)]
struct CollectingSink {
    roots: Mutex<Vec<(Address, Address)>>,
}

impl EvacuationSink for CollectingSink {
    fn do_root(&self, _worker_id: usize, slot: Address, target: Address) {
        self.roots.lock().unwrap().push((slot, target));
    }
}

/// Drive a complete concurrent sweep.
fn run_full_sweep(env: &PauseEnv) {
    let sweep = env.refine.sweep_state();
    sweep.start_work();
    assert!(sweep.swap_global_card_table(&env.heap));
    assert!(sweep.swap_java_threads_ct(&env.heap));
    assert!(sweep.synchronize_gc_threads());
    sweep.snapshot_heap(&env.heap, true);
    sweep.sweep_refinement_table_start();
    assert!(sweep.sweep_refinement_table_step(&env.heap, env.refine.workers(), 2));
    sweep.complete_work(true);
    assert_eq!(sweep.state(), RefineState::Idle);
}

/// Refine-and-merge cycle: a mutator-dirtied card with a collection set
/// reference travels through the concurrent sweep onto the card table,
/// is scanned exactly once, and everything ends up clean.
#[test]
fn refine_and_merge_cycle() {
    let env = pause_env();
    let heap = &env.heap;

    // Source region 0 (old), target region 5 (eden, in the next
    // collection set by construction).
    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(100));
    heap.allocate_region(5, RegionKind::Eden);
    heap.region(5).set_in_collection_set(true);
    let target = heap.region(5).bottom() + 16;

    let slot = addr(50) + 8;
    env.scanner.add_ref(slot, target);
    env.mutator.write_barrier(slot);
    assert_eq!(heap.card_table().get(50), card_table::DIRTY_CARD);

    run_full_sweep(&env);

    // The sweep moved the dirty mark from the (swapped) refinement table
    // onto the new card table as a to-cset card, and recorded the card in
    // region 5's remembered set.
    assert!(heap.refinement_table().is_clean(50));
    assert_eq!(heap.card_table().get(50), card_table::TO_CSET_CARD);
    assert!(heap.region(5).rem_set().contains_reference(slot));
    let stats = env.refine.sweep_state().stats();
    assert_eq!(stats.cards_refer_to_cset, 1);

    // STW pause: merge and scan.
    env.rem_set.prepare_all_regions_for_scan();
    env.rem_set.merge_heap_roots(&env.workers, &[5], true);
    let sink = CollectingSink::default();
    let scan_stats = env.rem_set.scan_heap_roots(&env.workers, &sink, false);
    assert_eq!(scan_stats.heap_roots_found, 1);
    assert_eq!(sink.roots.lock().unwrap().as_slice(), &[(slot, target)]);

    env.rem_set.complete_evac_phase(false);
    env.rem_set.cleanup_after_scan_heap_roots(&env.workers);
    assert!(heap.card_table().is_clean(50));
    let cards = heap.geometry().cards_per_region() as usize;
    assert!(heap
        .card_table()
        .is_range_clean(5 * cards, 6 * cards));
}

/// A sweep interrupted after the snapshot hands its claims to the pause,
/// which merges the leftover refinement table from where the sweep
/// stopped.
#[test]
fn interrupted_sweep_continues_in_merge() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(100));
    heap.allocate_region(5, RegionKind::Eden);
    heap.region(5).set_in_collection_set(true);
    let target = heap.region(5).bottom() + 16;
    let slot = addr(30);
    env.scanner.add_ref(slot, target);
    env.mutator.write_barrier(slot);

    // The sweep gets as far as the snapshot, then a GC preempts it.
    let sweep = env.refine.sweep_state();
    sweep.start_work();
    assert!(sweep.swap_global_card_table(&env.heap));
    assert!(sweep.swap_java_threads_ct(&env.heap));
    assert!(sweep.synchronize_gc_threads());
    sweep.snapshot_heap(&env.heap, true);
    assert_eq!(sweep.state(), RefineState::SweepRT);
    assert!(sweep.is_in_progress());

    // Pause: phase 1 folds the unswept refinement card into the card
    // table.
    env.rem_set.prepare_all_regions_for_scan();
    env.rem_set.merge_heap_roots(&env.workers, &[5], true);
    assert!(!sweep.is_in_progress(), "merge must force the machine idle");
    assert!(heap.refinement_table().is_clean(30));
    assert_eq!(heap.card_table().get(30), card_table::DIRTY_CARD);

    let sink = CollectingSink::default();
    let scan_stats = env.rem_set.scan_heap_roots(&env.workers, &sink, false);
    assert_eq!(scan_stats.heap_roots_found, 1);
    assert_eq!(scan_stats.cards_pending, 1);

    env.rem_set.complete_evac_phase(false);
    env.rem_set.cleanup_after_scan_heap_roots(&env.workers);
}

/// A pipeline interrupted before any snapshot: the merge builds one from
/// scratch and still picks up refinement table content.
#[test]
fn merge_builds_snapshot_from_scratch() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(100));
    heap.allocate_region(5, RegionKind::Eden);
    heap.region(5).set_in_collection_set(true);
    let target = heap.region(5).bottom() + 16;
    let slot = addr(31);
    env.scanner.add_ref(slot, target);

    // Simulate a mutator that already wrote through a swapped table: the
    // dirty mark sits on the refinement table.
    heap.refinement_table().dirty_card_for(slot);

    let sweep = env.refine.sweep_state();
    sweep.start_work();
    assert_eq!(sweep.state(), RefineState::SwapGlobalCT);

    env.rem_set.prepare_all_regions_for_scan();
    env.rem_set.merge_heap_roots(&env.workers, &[5], true);
    assert!(!sweep.is_in_progress());
    assert_eq!(heap.card_table().get(31), card_table::DIRTY_CARD);
    assert!(heap.refinement_table().is_clean(31));

    let sink = CollectingSink::default();
    let scan_stats = env.rem_set.scan_heap_roots(&env.workers, &sink, false);
    assert_eq!(scan_stats.heap_roots_found, 1);

    env.rem_set.complete_evac_phase(false);
    env.rem_set.cleanup_after_scan_heap_roots(&env.workers);
}

/// An optional evacuation increment must not rescan cards the initial
/// increment already scanned.
#[test]
fn optional_increment_skips_scanned_cards() {
    let env = pause_env();
    let heap = &env.heap;

    // Region 0: source. Region 1: initial collection set. Region 2: old,
    // becomes part of the optional increment.
    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(200));
    heap.allocate_region(1, RegionKind::Eden);
    heap.region(1).set_in_collection_set(true);
    heap.allocate_region(2, RegionKind::Old);
    heap.region(2).set_top(heap.region(2).bottom() + 64 * BYTES_IN_CARD);
    heap.region(2).rem_set().set_state_complete();

    let slot1 = addr(40);
    let target1 = heap.region(1).bottom() + 24;
    env.scanner.add_ref(slot1, target1);
    let slot2 = addr(90);
    let target2 = heap.region(2).bottom() + 24;
    env.scanner.add_ref(slot2, target2);

    // Remembered sets: region 1 knows about card 40; region 2 about both
    // cards.
    heap.region(1).rem_set().add_reference(slot1, 0);
    heap.region(2).rem_set().add_reference(slot1, 1);
    heap.region(2).rem_set().add_reference(slot2, 1);

    // Initial increment. Scanned cards stay marked because an optional
    // increment may follow.
    env.rem_set.prepare_all_regions_for_scan();
    env.rem_set.merge_heap_roots(&env.workers, &[1], true);
    let sink = CollectingSink::default();
    let stats = env.rem_set.scan_heap_roots(&env.workers, &sink, true);
    assert_eq!(stats.heap_roots_found, 1);
    assert_eq!(heap.card_table().get(40), card_table::SCANNED_CARD);
    env.rem_set.complete_evac_phase(true);

    // Region 2 joins the collection set for the optional increment; it is
    // no longer a scan source.
    heap.region(2).set_in_collection_set(true);
    env.rem_set.exclude_region_from_scan(2);
    env.rem_set.merge_heap_roots(&env.workers, &[2], false);
    // The already-scanned card was not re-marked.
    assert_eq!(heap.card_table().get(40), card_table::SCANNED_CARD);
    assert_eq!(heap.card_table().get(90), card_table::FROM_REMSET_CARD);

    let sink2 = CollectingSink::default();
    let stats2 = env.rem_set.scan_heap_roots(&env.workers, &sink2, true);
    // Only the fresh card was visited; no duplicates from the scanned
    // range.
    assert_eq!(stats2.cards_scanned, 1);
    assert_eq!(stats2.heap_roots_found, 1);
    assert_eq!(sink2.roots.lock().unwrap().as_slice(), &[(slot2, target2)]);

    env.rem_set.complete_evac_phase(true);
    env.rem_set.cleanup_after_scan_heap_roots(&env.workers);
    // Every touched card is clean again, including the scanned ones.
    assert!(heap.card_table().is_clean(40));
    assert!(heap.card_table().is_clean(90));
}

/// Young regions are bulk-cleared by the sweep without card inspection.
#[test]
fn sweep_bulk_clears_young_regions() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(3, RegionKind::Eden);
    let young_card = 3 * heap.geometry().cards_per_region() as usize + 7;
    env.mutator.write_barrier(addr(young_card));

    run_full_sweep(&env);

    assert!(heap.refinement_table().is_clean(young_card));
    // Nothing was refined out of the young region.
    let stats = env.refine.sweep_state().stats();
    assert_eq!(stats.cards_refer_to_cset, 0);
    assert_eq!(stats.cards_not_parsable, 0);
}

/// An unparsable card stays dirty (re-dirtied on the card table) and is
/// counted, not lost.
#[test]
fn unparsable_card_is_retried() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(100));
    let slot = addr(60);
    env.mutator.write_barrier(slot);
    env.scanner.set_unparsable(60, true);

    run_full_sweep(&env);

    let stats = env.refine.sweep_state().stats();
    assert_eq!(stats.cards_not_parsable, 1);
    assert!(heap.refinement_table().is_clean(60));
    // Re-dirtied on the card table for a later retry.
    assert_eq!(heap.card_table().get(60), card_table::DIRTY_CARD);
}

/// Workers yield between chunks when a safepoint is pending and resume
/// where they left off.
#[test]
fn sweep_yields_and_resumes() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(heap.region(0).end());
    heap.allocate_region(1, RegionKind::Old);
    heap.region(1).set_top(heap.region(1).end());

    let sweep = env.refine.sweep_state();
    sweep.start_work();
    assert!(sweep.swap_global_card_table(heap));
    assert!(sweep.swap_java_threads_ct(heap));
    assert!(sweep.synchronize_gc_threads());
    sweep.snapshot_heap(heap, true);
    sweep.sweep_refinement_table_start();

    heap.yield_flag().request();
    assert!(
        !sweep.sweep_refinement_table_step(heap, env.refine.workers(), 1),
        "a requested yield must leave the sweep incomplete"
    );
    assert_eq!(sweep.state(), RefineState::SweepRT);

    heap.yield_flag().clear();
    assert!(sweep.sweep_refinement_table_step(heap, env.refine.workers(), 1));
    sweep.complete_work(true);
    assert_eq!(sweep.state(), RefineState::Idle);
}

/// A freed region's claims saturate so an in-progress sweep skips it.
#[test]
fn reclaimed_region_is_skipped_by_sweep() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(heap.region(0).end());

    let sweep = env.refine.sweep_state();
    sweep.start_work();
    assert!(sweep.swap_global_card_table(heap));
    assert!(sweep.swap_java_threads_ct(heap));
    assert!(sweep.synchronize_gc_threads());
    sweep.snapshot_heap(heap, true);
    assert!(sweep.sweep_table().has_unclaimed_cards(0));

    env.refine.notify_region_reclaimed(0);
    assert!(!sweep.sweep_table().has_unclaimed_cards(0));

    sweep.cancel();
}

/// The write barrier keeps working across repeated sweep cycles, always
/// hitting the table the last handshake installed.
#[test]
fn repeated_sweeps_swap_tables_back_and_forth() {
    let env = pause_env();
    let heap = &env.heap;

    heap.allocate_region(0, RegionKind::Old);
    heap.region(0).set_top(addr(200));

    for round in 0..4usize {
        let card = 10 + round;
        env.mutator.write_barrier(addr(card));
        assert_eq!(heap.card_table().get(card), card_table::DIRTY_CARD);
        run_full_sweep(&env);
        assert!(heap.refinement_table().is_clean(card));
    }
    // Four rounds, four cards examined as non-clean in total.
    let stats = env.refine.sweep_state().stats();
    assert_eq!(stats.cards_no_cross_region, 1, "stats are per cycle");
}
