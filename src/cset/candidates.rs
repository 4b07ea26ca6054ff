//! Collection set candidate lists.
//!
//! Two lists of old regions eligible for evacuation: `marking` regions
//! selected at the end of the last concurrent mark, and `retained`
//! regions carried over from failed or deferred evacuations. Both are
//! kept sorted by GC efficiency, best first. All mutation happens at
//! safepoints.

/// One candidate region with its selection bookkeeping.
#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub region_idx: u32,
    /// Predicted reclaimable bytes per unit of evacuation time; higher is
    /// better.
    pub gc_efficiency: f64,
    num_unreclaimed_attempts: u32,
}

impl CandidateInfo {
    pub fn new(region_idx: u32, gc_efficiency: f64) -> CandidateInfo {
        CandidateInfo {
            region_idx,
            gc_efficiency,
            num_unreclaimed_attempts: 0,
        }
    }

    /// Count one more pause in which this (pinned) candidate could not be
    /// reclaimed. Returns true while the region should stay a candidate,
    /// false once the cap is reached.
    pub fn update_num_unreclaimed(&mut self, cap: u32) -> bool {
        self.num_unreclaimed_attempts += 1;
        self.num_unreclaimed_attempts < cap
    }

    pub fn num_unreclaimed_attempts(&self) -> u32 {
        self.num_unreclaimed_attempts
    }
}

/// An efficiency-sorted list of candidates.
#[derive(Default)]
pub struct CandidateList {
    infos: Vec<CandidateInfo>,
}

impl CandidateList {
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateInfo> {
        self.infos.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CandidateInfo> {
        self.infos.iter_mut()
    }

    pub fn append_unsorted(&mut self, info: CandidateInfo) {
        self.infos.push(info);
    }

    /// Remove the named regions, keeping the order of the rest.
    pub fn remove(&mut self, regions: &[u32]) {
        self.infos.retain(|info| !regions.contains(&info.region_idx));
    }

    pub fn sort_by_efficiency(&mut self) {
        self.infos.sort_by(|a, b| {
            b.gc_efficiency
                .partial_cmp(&a.gc_efficiency)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn clear(&mut self) {
        self.infos.clear();
    }
}

/// The collector-wide candidate state.
#[derive(Default)]
pub struct Candidates {
    marking: CandidateList,
    retained: CandidateList,
    /// Length of the marking list when it was last rebuilt by remark; the
    /// divisor for the per-pause minimum.
    last_marking_candidates_length: usize,
}

impl Candidates {
    /// Install a fresh marking candidate list (remark end).
    pub fn set_candidates_from_marking(&mut self, mut infos: Vec<CandidateInfo>) {
        self.last_marking_candidates_length = infos.len();
        infos.sort_by(|a, b| {
            b.gc_efficiency
                .partial_cmp(&a.gc_efficiency)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.marking.infos = infos;
    }

    pub fn marking_regions(&self) -> &CandidateList {
        &self.marking
    }

    pub fn marking_regions_mut(&mut self) -> &mut CandidateList {
        &mut self.marking
    }

    pub fn retained_regions(&self) -> &CandidateList {
        &self.retained
    }

    pub fn retained_regions_mut(&mut self) -> &mut CandidateList {
        &mut self.retained
    }

    pub fn last_marking_candidates_length(&self) -> usize {
        self.last_marking_candidates_length
    }

    pub fn is_empty(&self) -> bool {
        self.marking.is_empty() && self.retained.is_empty()
    }

    pub fn has_more_marking_candidates(&self) -> bool {
        !self.marking.is_empty()
    }

    pub fn add_retained_region_unsorted(&mut self, info: CandidateInfo) {
        self.retained.append_unsorted(info);
    }

    /// Remove regions from whichever list holds them.
    pub fn remove(&mut self, regions: &[u32]) {
        self.marking.remove(regions);
        self.retained.remove(regions);
    }

    pub fn sort_by_efficiency(&mut self) {
        self.retained.sort_by_efficiency();
    }

    pub fn sort_marking_by_efficiency(&mut self) {
        self.marking.sort_by_efficiency();
    }

    pub fn clear(&mut self) {
        self.marking.clear();
        self.retained.clear();
        self.last_marking_candidates_length = 0;
    }

    #[cfg(debug_assertions)]
    pub fn verify(&self) {
        let sorted = |list: &CandidateList| {
            list.infos
                .windows(2)
                .all(|pair| pair[0].gc_efficiency >= pair[1].gc_efficiency)
        };
        debug_assert!(sorted(&self.marking), "marking candidates unsorted");
        debug_assert!(sorted(&self.retained), "retained candidates unsorted");
    }

    #[cfg(not(debug_assertions))]
    pub fn verify(&self) {}
}
