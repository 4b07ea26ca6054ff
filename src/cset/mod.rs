//! Collection set finalization.
//!
//! Given a pause time budget and per-region cost predictions, select which
//! old regions join the young regions in this pause's collection set, which
//! are queued as optional (evacuated only if time remains), and what
//! happens to pinned regions. Pinned marking candidates are shifted to the
//! retained list so the mixed phase still makes progress; pinned retained
//! candidates are aged out after a configurable number of attempts.

pub mod candidates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::heap::{Heap, RegionKind};
use crate::policy::Policy;
use crate::util::options::Options;

use candidates::{CandidateInfo, Candidates};

pub struct CollectionSet {
    heap: Arc<Heap>,
    policy: Arc<dyn Policy>,
    options: Arc<Options>,
    candidates: spin::Mutex<Candidates>,
    /// Regions of the current pause's collection set (young plus initial
    /// old).
    collection_set_regions: spin::Mutex<Vec<u32>>,
    /// Old regions queued for optional evacuation increments, in selection
    /// order.
    optional_regions: spin::Mutex<Vec<u32>>,
    in_mixed_phase: AtomicBool,
}

impl CollectionSet {
    pub fn new(heap: Arc<Heap>, policy: Arc<dyn Policy>, options: Arc<Options>) -> CollectionSet {
        CollectionSet {
            heap,
            policy,
            options,
            candidates: spin::Mutex::new(Candidates::default()),
            collection_set_regions: spin::Mutex::new(Vec::new()),
            optional_regions: spin::Mutex::new(Vec::new()),
            in_mixed_phase: AtomicBool::new(false),
        }
    }

    pub fn set_in_mixed_phase(&self, mixed: bool) {
        self.in_mixed_phase.store(mixed, Ordering::Relaxed);
    }

    pub fn in_mixed_phase(&self) -> bool {
        self.in_mixed_phase.load(Ordering::Relaxed)
    }

    /// Install the marking candidates computed at remark end.
    pub fn set_candidates_from_marking(&self, infos: Vec<CandidateInfo>) {
        self.candidates.lock().set_candidates_from_marking(infos);
    }

    pub fn with_candidates<R>(&self, f: impl FnOnce(&mut Candidates) -> R) -> R {
        f(&mut self.candidates.lock())
    }

    /// Add a young region at allocation time.
    pub fn add_young_region(&self, region_idx: u32) {
        let region = self.heap.region(region_idx);
        debug_assert!(region.is_young());
        region.set_in_collection_set(true);
        self.collection_set_regions.lock().push(region_idx);
    }

    pub fn regions(&self) -> Vec<u32> {
        self.collection_set_regions.lock().clone()
    }

    pub fn optional_regions(&self) -> Vec<u32> {
        self.optional_regions.lock().clone()
    }

    pub fn optional_region_length(&self) -> usize {
        self.optional_regions.lock().len()
    }

    /// Drop all collection set membership at pause end.
    pub fn clear(&self) {
        let mut regions = self.collection_set_regions.lock();
        for &region_idx in regions.iter() {
            self.heap.region(region_idx).set_in_collection_set(false);
        }
        regions.clear();
        debug_assert!(self.optional_regions.lock().is_empty(), "optional regions left behind");
    }

    // --- Young part -------------------------------------------------------

    /// Predict the fixed cost of the pause and return the time left for
    /// old regions.
    pub fn finalize_young_part(&self, target_pause_time_ms: f64, pending_cards: usize) -> f64 {
        assert!(
            target_pause_time_ms > 0.0,
            "target pause time {target_pause_time_ms} must be positive"
        );

        let mut eden_count = 0usize;
        let mut survivor_count = 0usize;
        let mut survivor_rs_cards = 0usize;
        for &region_idx in self.collection_set_regions.lock().iter() {
            let region = self.heap.region(region_idx);
            match region.kind() {
                RegionKind::Eden => eden_count += 1,
                RegionKind::Survivor => {
                    survivor_count += 1;
                    survivor_rs_cards += region.rem_set().occupied();
                }
                _ => {}
            }
        }

        let predicted_base_time_ms = self.policy.predict_base_time_ms(pending_cards, survivor_rs_cards);
        // Base time already covers all remembered set work; only the young
        // region handling itself is added here.
        let predicted_eden_time_ms = self.policy.predict_young_region_other_time_ms(eden_count)
            + self.policy.predict_eden_copy_time_ms(eden_count);
        let remaining_time_ms =
            (target_pause_time_ms - predicted_base_time_ms - predicted_eden_time_ms).max(0.0);

        trace!(
            "young part of collection set chosen: eden {eden_count}, survivors {survivor_count}, \
             predicted eden time {predicted_eden_time_ms:.2}ms, predicted base time \
             {predicted_base_time_ms:.2}ms, target {target_pause_time_ms:.2}ms, remaining \
             {remaining_time_ms:.2}ms"
        );
        remaining_time_ms
    }

    // --- Old part ---------------------------------------------------------

    fn calc_min_old_cset_length(&self, candidates: &Candidates) -> usize {
        // All marking candidates should be evacuated within
        // mixed_gc_count_target mixed collections.
        let last = candidates.last_marking_candidates_length();
        last.div_ceil(*self.options.mixed_gc_count_target)
    }

    fn calc_max_old_cset_length(&self) -> usize {
        (self.heap.num_regions() * *self.options.old_cset_region_threshold_percent).div_ceil(100)
    }

    fn min_retained_old_cset_length(&self) -> usize {
        (*self.options.parallel_gc_threads / 4).max(1)
    }

    fn max_time_for_retaining_ms(&self) -> f64 {
        *self.options.max_gc_pause_millis as f64
            * *self.options.retained_regions_time_percent as f64
            / 100.0
    }

    /// Select old regions for this pause given the remaining time budget.
    pub fn finalize_old_part(&self, mut time_remaining_ms: f64) {
        let mut candidates = self.candidates.lock();
        if candidates.is_empty() {
            debug!("no candidates to reclaim");
            return;
        }
        candidates.verify();

        let mut initial_old_regions = Vec::new();
        let mut pinned_marking_regions = Vec::new();
        let mut pinned_retained_regions = Vec::new();
        debug_assert!(self.optional_regions.lock().is_empty());

        if self.in_mixed_phase() {
            time_remaining_ms = self.select_candidates_from_marking(
                &mut candidates,
                time_remaining_ms,
                &mut initial_old_regions,
                &mut pinned_marking_regions,
            );
        } else {
            debug!("do not add marking candidates to collection set due to pause type");
        }

        self.select_candidates_from_retained(
            &mut candidates,
            time_remaining_ms,
            &mut initial_old_regions,
            &mut pinned_retained_regions,
        );

        // Move the initially selected old regions into the collection set
        // right away; optional regions are only prepared.
        self.move_candidates_to_collection_set(&mut candidates, &initial_old_regions);
        self.prepare_optional_regions();
        // Shift pinned marking regions to the retained candidates so the
        // mixed phase keeps making progress.
        self.move_pinned_marking_to_retained(&mut candidates, pinned_marking_regions);
        // Pinned retained regions that have exhausted their attempts become
        // plain old regions again.
        self.drop_pinned_retained_regions(&mut candidates, &pinned_retained_regions);

        candidates.verify();
        self.collection_set_regions.lock().sort_unstable();
    }

    fn select_candidates_from_marking(
        &self,
        candidates: &mut Candidates,
        mut time_remaining_ms: f64,
        initial_old_regions: &mut Vec<u32>,
        pinned_old_regions: &mut Vec<CandidateInfo>,
    ) -> f64 {
        let mut num_expensive_regions = 0usize;
        let mut num_optional_regions_selected = 0usize;
        let mut num_pinned_regions = 0usize;
        let mut predicted_initial_time_ms = 0.0;
        let mut predicted_optional_time_ms = 0.0;

        let optional_threshold_ms =
            time_remaining_ms * *self.options.optional_cset_prediction_percent as f64 / 100.0;

        let min_old_cset_length = self.calc_min_old_cset_length(candidates);
        let max_old_cset_length = min_old_cset_length.max(self.calc_max_old_cset_length());
        let check_time_remaining = self.policy.use_adaptive_young_list_length();
        let pinned_cap = *self.options.num_collections_keep_pinned as u32;

        let mut optional = self.optional_regions.lock();

        debug!(
            "start adding marking candidates to collection set: min {} regions, max {} regions, \
             available {}, time remaining {:.2}ms, optional threshold {:.2}ms",
            min_old_cset_length,
            max_old_cset_length,
            candidates.marking_regions().len(),
            time_remaining_ms,
            optional_threshold_ms
        );

        let mut exhausted = true;
        for info in candidates.marking_regions_mut().iter_mut() {
            if initial_old_regions.len() + num_optional_regions_selected >= max_old_cset_length {
                debug!("finish adding marking candidates: maximum number of regions reached");
                exhausted = false;
                break;
            }
            let region = self.heap.region(info.region_idx);
            // Evacuating a pinned region frees no memory; move it towards
            // the retained candidates for a later attempt instead of
            // spending pause time on it now.
            if region.has_pinned_objects() {
                num_pinned_regions += 1;
                info.update_num_unreclaimed(pinned_cap);
                trace!(
                    "marking candidate {} cannot be reclaimed currently, skipping",
                    info.region_idx
                );
                pinned_old_regions.push(info.clone());
                continue;
            }

            let predicted_time_ms = self.policy.predict_region_total_time_ms(region, false);
            time_remaining_ms = (time_remaining_ms - predicted_time_ms).max(0.0);

            if initial_old_regions.len() < min_old_cset_length {
                // Take regions until the minimum, budget or not.
                initial_old_regions.push(info.region_idx);
                predicted_initial_time_ms += predicted_time_ms;
                if time_remaining_ms == 0.0 {
                    num_expensive_regions += 1;
                }
            } else if !check_time_remaining {
                debug!("finish adding marking candidates: region amount reached min");
                exhausted = false;
                break;
            } else if time_remaining_ms > optional_threshold_ms {
                initial_old_regions.push(info.region_idx);
                predicted_initial_time_ms += predicted_time_ms;
            } else if time_remaining_ms > 0.0 {
                // Keep adding optional regions until time is up.
                predicted_optional_time_ms += predicted_time_ms;
                optional.push(info.region_idx);
                num_optional_regions_selected += 1;
            } else {
                debug!("finish adding marking candidates: predicted time too high");
                exhausted = false;
                break;
            }
        }
        if exhausted {
            debug!("marking candidates exhausted");
        }
        if num_expensive_regions > 0 {
            debug!(
                "added {num_expensive_regions} marking candidates to collection set although \
                 the predicted time was too high"
            );
        }
        debug!(
            "finish adding marking candidates: initial {}, optional {}, pinned {}, predicted \
             initial {:.2}ms, predicted optional {:.2}ms, time remaining {:.2}ms",
            initial_old_regions.len(),
            num_optional_regions_selected,
            num_pinned_regions,
            predicted_initial_time_ms,
            predicted_optional_time_ms,
            time_remaining_ms
        );
        time_remaining_ms
    }

    fn select_candidates_from_retained(
        &self,
        candidates: &mut Candidates,
        mut time_remaining_ms: f64,
        initial_old_regions: &mut Vec<u32>,
        pinned_old_regions: &mut Vec<u32>,
    ) {
        let mut num_initial_regions_selected = 0usize;
        let mut num_optional_regions_selected = 0usize;
        let mut num_expensive_regions_selected = 0usize;
        let mut num_pinned_regions = 0usize;
        let mut predicted_initial_time_ms = 0.0;
        let mut predicted_optional_time_ms = 0.0;

        let min_regions = self.min_retained_old_cset_length();
        let pinned_cap = *self.options.num_collections_keep_pinned as u32;
        // Retained regions should be reclaimed soon, but must not dominate
        // the pause: they get their own small budget, and the
        // unconditional part is additionally bounded by the overall
        // remaining time.
        let mut optional_time_remaining_ms = self.max_time_for_retaining_ms();
        time_remaining_ms = time_remaining_ms.min(optional_time_remaining_ms);

        let in_young_only_phase = !self.in_mixed_phase();
        let mut optional = self.optional_regions.lock();

        debug!(
            "start adding retained candidates to collection set: min {} regions, available {}, \
             time remaining {:.2}ms, optional remaining {:.2}ms",
            min_regions,
            candidates.retained_regions().len(),
            time_remaining_ms,
            optional_time_remaining_ms
        );

        for info in candidates.retained_regions_mut().iter_mut() {
            let region = self.heap.region(info.region_idx);
            let predicted_time_ms = self.policy.predict_region_total_time_ms(region, in_young_only_phase);
            let fits_in_remaining_time = predicted_time_ms <= time_remaining_ms;

            if region.has_pinned_objects() {
                num_pinned_regions += 1;
                if info.update_num_unreclaimed(pinned_cap) {
                    trace!(
                        "retained candidate {} cannot be reclaimed currently, skipping",
                        info.region_idx
                    );
                } else {
                    trace!(
                        "retained candidate {} cannot be reclaimed currently, dropping",
                        info.region_idx
                    );
                    pinned_old_regions.push(info.region_idx);
                }
                continue;
            }

            if fits_in_remaining_time || num_expensive_regions_selected < min_regions {
                predicted_initial_time_ms += predicted_time_ms;
                if !fits_in_remaining_time {
                    num_expensive_regions_selected += 1;
                }
                initial_old_regions.push(info.region_idx);
                num_initial_regions_selected += 1;
            } else if predicted_time_ms <= optional_time_remaining_ms {
                predicted_optional_time_ms += predicted_time_ms;
                optional.push(info.region_idx);
                num_optional_regions_selected += 1;
            } else {
                // Fits neither the initial nor the optional budget.
                break;
            }
            time_remaining_ms = (time_remaining_ms - predicted_time_ms).max(0.0);
            optional_time_remaining_ms = (optional_time_remaining_ms - predicted_time_ms).max(0.0);
        }

        let num_selected = num_initial_regions_selected + num_optional_regions_selected;
        if num_selected == candidates.retained_regions().len() {
            debug!("retained candidates exhausted");
        }
        if num_expensive_regions_selected > 0 {
            debug!(
                "added {num_expensive_regions_selected} retained candidates to collection set \
                 although the predicted time was too high"
            );
        }
        debug!(
            "finish adding retained candidates: initial {}, optional {}, pinned {}, predicted \
             initial {:.2}ms, predicted optional {:.2}ms, time remaining {:.2}ms, optional time \
             remaining {:.2}ms",
            num_initial_regions_selected,
            num_optional_regions_selected,
            num_pinned_regions,
            predicted_initial_time_ms,
            predicted_optional_time_ms,
            time_remaining_ms,
            optional_time_remaining_ms
        );
    }

    fn move_candidates_to_collection_set(&self, candidates: &mut Candidates, regions: &[u32]) {
        if regions.is_empty() {
            return;
        }
        let mut cset = self.collection_set_regions.lock();
        for &region_idx in regions {
            let region = self.heap.region(region_idx);
            region.clear_index_in_opt_cset();
            region.set_in_collection_set(true);
            cset.push(region_idx);
        }
        candidates.remove(regions);
    }

    fn prepare_optional_regions(&self) {
        let optional = self.optional_regions.lock();
        for (position, &region_idx) in optional.iter().enumerate() {
            let region = self.heap.region(region_idx);
            debug_assert!(region.is_old(), "optional region {region_idx} should be old");
            debug_assert!(!region.in_collection_set());
            region.set_index_in_opt_cset(position as u32);
        }
    }

    fn move_pinned_marking_to_retained(&self, candidates: &mut Candidates, regions: Vec<CandidateInfo>) {
        if regions.is_empty() {
            return;
        }
        let indices: Vec<u32> = regions.iter().map(|info| info.region_idx).collect();
        candidates.remove(&indices);
        for info in regions {
            let region = self.heap.region(info.region_idx);
            debug_assert!(region.has_pinned_objects(), "must be pinned");
            debug_assert!(region.rem_set().is_complete(), "must be complete");
            candidates.add_retained_region_unsorted(info);
        }
        candidates.sort_by_efficiency();
    }

    fn drop_pinned_retained_regions(&self, candidates: &mut Candidates, regions: &[u32]) {
        if regions.is_empty() {
            return;
        }
        candidates.remove(regions);
        // These regions' remembered sets are no longer needed.
        for &region_idx in regions {
            self.heap.region(region_idx).rem_set().clear(true, false);
        }
    }

    /// Entry point at pause start.
    pub fn finalize_initial_collection_set(&self, target_pause_time_ms: f64, pending_cards: usize) {
        let time_remaining_ms = self.finalize_young_part(target_pause_time_ms, pending_cards);
        self.finalize_old_part(time_remaining_ms);
    }

    // --- Optional increments ----------------------------------------------

    fn select_candidates_from_optional_regions(&self, mut time_remaining_ms: f64) -> Vec<u32> {
        debug_assert!(self.optional_region_length() > 0);
        let mut selected = Vec::new();
        let mut total_prediction_ms = 0.0;

        let optional = self.optional_regions.lock();
        for &region_idx in optional.iter() {
            let prediction_ms = self
                .policy
                .predict_region_total_time_ms(self.heap.region(region_idx), false);
            if prediction_ms > time_remaining_ms {
                debug!(
                    "prediction {:.3}ms for region {} does not fit remaining time {:.3}ms",
                    prediction_ms, region_idx, time_remaining_ms
                );
                break;
            }
            total_prediction_ms += prediction_ms;
            time_remaining_ms -= prediction_ms;
            selected.push(region_idx);
        }
        debug!(
            "prepared {} regions out of {} for optional evacuation, total predicted time {:.3}ms",
            selected.len(),
            optional.len(),
            total_prediction_ms
        );
        selected
    }

    /// Pull as many optional regions as fit in the remaining pause time
    /// into the collection set. Returns the regions of the new increment
    /// (empty means: abandon).
    pub fn finalize_optional_for_evacuation(&self, remaining_pause_time_ms: f64) -> Vec<u32> {
        let selected = self.select_candidates_from_optional_regions(remaining_pause_time_ms);
        self.move_candidates_to_collection_set(&mut self.candidates.lock(), &selected);
        self.optional_regions.lock().retain(|idx| !selected.contains(idx));
        selected
    }

    /// Not enough time for any further optional increment: clear the
    /// optional regions' collection set attributes and leave them as
    /// candidates for the next GC.
    pub fn abandon_optional_collection_set(&self, mut on_abandoned: impl FnMut(u32)) {
        let mut optional = self.optional_regions.lock();
        for &region_idx in optional.iter() {
            let region = self.heap.region(region_idx);
            debug_assert!(!region.in_collection_set());
            region.clear_index_in_opt_cset();
            on_abandoned(region_idx);
        }
        optional.clear();
    }
}
