use std::fmt::Debug;

/// A single typed option.
///
/// Options carry a validator so invalid settings are rejected at the point
/// they are made rather than when the value is consumed. To read an option,
/// dereference it (for example `*options.parallel_gc_threads`).
#[derive(Clone)]
pub struct RemSetOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone> RemSetOption<T> {
    pub fn new(value: T, validator: fn(&T) -> bool) -> Self {
        let option = RemSetOption { value, validator };
        assert!(
            (option.validator)(&option.value),
            "default value {:?} does not validate",
            option.value
        );
        option
    }

    /// Set the option. Returns false (and leaves the value unchanged) if the
    /// new value does not validate.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

impl<T: Debug + Clone> std::ops::Deref for RemSetOption<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

fn non_zero(v: &usize) -> bool {
    *v > 0
}

fn power_of_two(v: &usize) -> bool {
    v.is_power_of_two()
}

fn percentage(v: &usize) -> bool {
    *v <= 100
}

fn power_of_two_or_zero(v: &usize) -> bool {
    *v == 0 || v.is_power_of_two()
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $ty:ty [$validator:expr] = $default:expr),* $(,)?) => {
        /// The set of tunables consumed by this crate.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: RemSetOption<$ty>),*
        }

        impl Options {
            /// Create an `Options` instance with the built-in defaults.
            pub fn new() -> Self {
                Options {
                    $($name: RemSetOption::new($default, $validator)),*
                }
            }

            /// Set a single option from its string representation. Returns
            /// false for unknown keys, unparsable values and values the
            /// option's validator rejects.
            pub fn set_from_str(&mut self, key: &str, value: &str) -> bool {
                match key {
                    $(stringify!($name) => match value.parse::<$ty>() {
                        Ok(typed) => self.$name.set(typed),
                        Err(_) => {
                            warn!("unable to parse {}={:?}; keeping current value", key, value);
                            false
                        }
                    },)*
                    _ => {
                        warn!("unknown option {:?}", key);
                        false
                    }
                }
            }

            /// Apply `REMSET_<OPTION>` environment variables.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "REMSET_";
                for (key, value) in std::env::vars() {
                    if let Some(stripped) = key.strip_prefix(PREFIX) {
                        let name = stripped.to_lowercase();
                        if !self.set_from_str(&name, &value) {
                            warn!("ignoring environment setting {}={}", key, value);
                        }
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

options! {
    /// Number of STW GC worker threads.
    parallel_gc_threads: usize [non_zero] = num_cpus::get(),
    /// Upper bound on the number of concurrent refinement worker threads.
    /// Zero disables concurrent refinement workers entirely.
    conc_refinement_threads: usize [always_valid] = num_cpus::get(),
    /// Whether concurrent refinement runs at all. When false, the STW pause
    /// takes full responsibility for all pending cards.
    use_conc_refinement: bool [always_valid] = true,
    /// Pause time goal in milliseconds.
    max_gc_pause_millis: usize [non_zero] = 200,
    /// Capacity, in cards, of the array-of-cards container.
    rem_set_array_of_cards_entries: usize [non_zero] = 32,
    /// Upper bound on the howl container fan-out. The effective number of
    /// buckets is derived from the container geometry and rounded down to a
    /// power of two no larger than this.
    rem_set_howl_num_buckets: usize [power_of_two] = 8,
    /// Percentage of a howl bucket bitmap's capacity at which the bucket is
    /// coarsened to the full sentinel.
    rem_set_coarsen_howl_bitmap_to_howl_full_percent: usize [percentage] = 90,
    /// Percentage of a region's card capacity at which a howl container is
    /// coarsened to the full sentinel.
    rem_set_coarsen_howl_to_full_percent: usize [percentage] = 90,
    /// Heap region size in bytes. Zero means "derive from the heap size";
    /// a non-zero value must be a power of two and is clamped to the
    /// supported range.
    heap_region_size: usize [power_of_two_or_zero] = 0,
    /// Percent of the pause time goal budgeted to remembered set updating
    /// (refining pending cards) during the pause.
    rset_updating_pause_time_percent: usize [percentage] = 10,
    /// Per-worker floor for the pending cards target.
    per_thread_pending_card_threshold: usize [non_zero] = 2048,
    /// Number of mixed GCs over which all marking candidates should be
    /// evacuated; denominator of the minimum old-region count per pause.
    mixed_gc_count_target: usize [non_zero] = 8,
    /// Cap on the number of old regions added to a single collection set,
    /// as a percentage of committed regions.
    old_cset_region_threshold_percent: usize [percentage] = 10,
    /// Liveness percentage below which an evacuation-failed region is
    /// retained as a collection set candidate instead of aged out.
    retain_region_live_threshold_percent: usize [percentage] = 85,
    /// Number of collections a pinned retained candidate is kept before its
    /// remembered set is dropped.
    num_collections_keep_pinned: usize [non_zero] = 8,
    /// Percent of the pause time goal budgeted to evacuating retained
    /// candidate regions.
    retained_regions_time_percent: usize [percentage] = 10,
    /// Percent of the remaining pause time below which marking candidates
    /// are queued as optional rather than initial regions.
    optional_cset_prediction_percent: usize [percentage] = 20,
    /// Size of the prefetch ring used when merging remembered sets onto the
    /// card table. Must be a power of two.
    merge_heap_roots_prefetch_cache_size: usize [power_of_two] = 16,
    /// Threshold, in cards, below which a humongous region's remembered set
    /// keeps it eligible for eager reclaim.
    eager_reclaim_remset_threshold: usize [always_valid] = 64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let options = Options::new();
        assert!(*options.use_conc_refinement);
        assert!((*options.rem_set_howl_num_buckets).is_power_of_two());
    }

    #[test]
    fn set_from_str_checks_validator() {
        let mut options = Options::new();
        assert!(options.set_from_str("mixed_gc_count_target", "4"));
        assert_eq!(*options.mixed_gc_count_target, 4);
        // Rejected: zero is not a valid count target.
        assert!(!options.set_from_str("mixed_gc_count_target", "0"));
        assert_eq!(*options.mixed_gc_count_target, 4);
        // Rejected: not a power of two.
        assert!(!options.set_from_str("heap_region_size", "3145728"));
        // Unknown key.
        assert!(!options.set_from_str("no_such_option", "1"));
    }
}
