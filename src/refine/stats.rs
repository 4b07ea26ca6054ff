//! Rolling refinement statistics.

use std::time::Duration;

/// Counters for one refinement sweep, or a worker's share of it. Workers
/// accumulate a local copy and merge it into the sweep-wide instance under
/// a lock when they finish.
#[derive(Default, Clone)]
pub struct RefineStats {
    pub cards_scanned: usize,
    pub cards_clean: usize,
    pub cards_not_parsable: usize,
    pub cards_already_refer_to_cset: usize,
    pub cards_refer_to_cset: usize,
    pub cards_no_cross_region: usize,
    pub sweep_duration: Duration,
    pub refine_duration: Duration,
    pub yield_during_sweep_duration: Duration,
}

impl RefineStats {
    pub fn cards_not_clean(&self) -> usize {
        self.cards_scanned - self.cards_clean
    }

    pub fn refined_cards(&self) -> usize {
        self.cards_not_clean()
    }

    /// Cards that will need attention at the next GC: everything examined
    /// except cards that were already known to point into the collection
    /// set.
    pub fn cards_pending(&self) -> usize {
        self.cards_not_clean() - self.cards_already_refer_to_cset
    }

    pub fn cards_to_cset(&self) -> usize {
        self.cards_already_refer_to_cset + self.cards_refer_to_cset
    }

    pub fn add(&mut self, other: &RefineStats) {
        self.cards_scanned += other.cards_scanned;
        self.cards_clean += other.cards_clean;
        self.cards_not_parsable += other.cards_not_parsable;
        self.cards_already_refer_to_cset += other.cards_already_refer_to_cset;
        self.cards_refer_to_cset += other.cards_refer_to_cset;
        self.cards_no_cross_region += other.cards_no_cross_region;
        self.sweep_duration += other.sweep_duration;
        self.refine_duration += other.refine_duration;
        self.yield_during_sweep_duration += other.yield_during_sweep_duration;
    }

    pub fn reset(&mut self) {
        *self = RefineStats::default();
    }
}

fn percent_of(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

impl RefineStats {
    pub fn log_summary(&self, total_duration: Duration) {
        debug!(
            "refinement took {:.2}ms (sweep {:.2}ms card refine {:.2}ms) \
             (scanned {} clean {} ({:.2}%) not_clean {} ({:.2}%) not_parsable {} \
             refers_to_cset {} ({:.2}%) still_refers_to_cset {} ({:.2}%) \
             no_cross_region {} pending {})",
            total_duration.as_secs_f64() * 1000.0,
            self.sweep_duration.as_secs_f64() * 1000.0,
            self.refine_duration.as_secs_f64() * 1000.0,
            self.cards_scanned,
            self.cards_clean,
            percent_of(self.cards_clean, self.cards_scanned),
            self.cards_not_clean(),
            percent_of(self.cards_not_clean(), self.cards_scanned),
            self.cards_not_parsable,
            self.cards_refer_to_cset,
            percent_of(self.cards_refer_to_cset, self.cards_not_clean()),
            self.cards_already_refer_to_cset,
            percent_of(self.cards_already_refer_to_cset, self.cards_not_clean()),
            self.cards_no_cross_region,
            self.cards_pending(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_counts() {
        let mut stats = RefineStats {
            cards_scanned: 100,
            cards_clean: 60,
            cards_already_refer_to_cset: 10,
            cards_refer_to_cset: 15,
            ..Default::default()
        };
        assert_eq!(stats.cards_not_clean(), 40);
        assert_eq!(stats.cards_pending(), 30);
        assert_eq!(stats.cards_to_cset(), 25);

        let other = stats.clone();
        stats.add(&other);
        assert_eq!(stats.cards_scanned, 200);
        assert_eq!(stats.cards_pending(), 60);

        stats.reset();
        assert_eq!(stats.cards_scanned, 0);
    }
}
