//! Card set container geometry.
//!
//! All container capacities and coarsening thresholds are derived once at
//! startup and shared by every per-region card set. Regions whose card
//! count exceeds what a container can address are virtualized into several
//! "card regions" (see the split accessors): a global card index splits
//! into a card-region index and a card within that card region with two
//! shifts and a mask.

use crate::util::constants::*;

use super::containers::{self, CardEntry};

/// The largest number of cards a single container may span. Bounds the
/// in-container card index so it fits the card entry type.
pub const LOG_CARDS_PER_REGION_LIMIT: u32 = 16;
pub const CARDS_PER_REGION_LIMIT: u32 = 1 << LOG_CARDS_PER_REGION_LIMIT;

const_assert!(CARDS_PER_REGION_LIMIT as usize <= 1 << (std::mem::size_of::<CardEntry>() * BITS_IN_BYTE));

pub struct CardSetConfig {
    inline_ptr_bits_per_card: u32,
    max_cards_in_array: u32,
    num_buckets_in_howl: u32,
    max_cards_in_card_set: u32,
    cards_in_howl_threshold: u32,
    max_cards_in_howl_bitmap: u32,
    cards_in_howl_bitmap_threshold: u32,
    log2_max_cards_in_howl_bitmap: u32,
    bitmap_hash_mask: u32,
    log2_card_regions_per_heap_region: u32,
    log2_cards_per_card_region: u32,
}

/// How many card regions each heap region must be split into so a single
/// in-container card index stays within [`CARDS_PER_REGION_LIMIT`].
fn default_log2_card_regions_per_heap_region(log_cards_per_region: u32) -> u32 {
    log_cards_per_region.saturating_sub(LOG_CARDS_PER_REGION_LIMIT)
}

impl CardSetConfig {
    /// The production configuration for heap regions with
    /// `2^log_cards_per_region` cards each.
    pub fn new(
        log_cards_per_region: u32,
        max_cards_in_array: u32,
        cards_in_bitmap_threshold_percent: u32,
        max_buckets_in_howl: u32,
        cards_in_howl_threshold_percent: u32,
    ) -> Self {
        let log2_card_regions = default_log2_card_regions_per_heap_region(log_cards_per_region);
        Self::with_geometry(
            max_cards_in_array,
            cards_in_bitmap_threshold_percent,
            max_buckets_in_howl,
            cards_in_howl_threshold_percent,
            1 << (log_cards_per_region - log2_card_regions),
            log2_card_regions,
        )
    }

    /// Fully explicit configuration. Test scenarios use this to force small
    /// container capacities.
    pub fn with_geometry(
        max_cards_in_array: u32,
        cards_in_bitmap_threshold_percent: u32,
        max_buckets_in_howl: u32,
        cards_in_howl_threshold_percent: u32,
        max_cards_in_card_set: u32,
        log2_card_regions_per_heap_region: u32,
    ) -> Self {
        assert!(
            max_cards_in_card_set.is_power_of_two(),
            "cards per card region must be a power of two: {max_cards_in_card_set}"
        );
        assert!(
            max_cards_in_card_set <= CARDS_PER_REGION_LIMIT,
            "cards per card region {max_cards_in_card_set} exceeds representable {CARDS_PER_REGION_LIMIT}"
        );
        assert!(cards_in_bitmap_threshold_percent <= 100);
        assert!(cards_in_howl_threshold_percent <= 100);

        let log2_cards_per_card_region = max_cards_in_card_set.ilog2();
        let inline_ptr_bits_per_card = log2_cards_per_card_region.max(1);
        let num_buckets_in_howl =
            Self::howl_buckets(max_cards_in_card_set, max_cards_in_array, max_buckets_in_howl);
        let max_cards_in_howl_bitmap = max_cards_in_card_set / num_buckets_in_howl;
        let log2_max_cards_in_howl_bitmap = max_cards_in_howl_bitmap.ilog2();

        let config = CardSetConfig {
            inline_ptr_bits_per_card,
            max_cards_in_array,
            num_buckets_in_howl,
            max_cards_in_card_set,
            cards_in_howl_threshold: (max_cards_in_card_set as u64
                * cards_in_howl_threshold_percent as u64
                / 100) as u32,
            max_cards_in_howl_bitmap,
            cards_in_howl_bitmap_threshold: (max_cards_in_howl_bitmap as u64
                * cards_in_bitmap_threshold_percent as u64
                / 100) as u32,
            log2_max_cards_in_howl_bitmap,
            bitmap_hash_mask: max_cards_in_howl_bitmap - 1,
            log2_card_regions_per_heap_region,
            log2_cards_per_card_region,
        };

        assert!(
            config.max_cards_in_inline_ptr() >= 1,
            "inline pointer must hold at least one card"
        );
        assert!(
            config.cards_in_howl_bitmap_threshold <= config.max_cards_in_howl_bitmap,
            "bitmap coarsening threshold out of range"
        );
        config.log_configuration();
        config
    }

    /// Number of howl buckets: bounded so that worst-case array memory is at
    /// most half of a whole-card-region bitmap, rounded down to a power of
    /// two (buckets are indexed by shift and mask), clamped to the
    /// configured maximum.
    fn howl_buckets(max_cards_in_card_set: u32, max_cards_in_array: u32, max_buckets: u32) -> u32 {
        let bitmap_bytes = containers::bitmap_bits_to_bytes(max_cards_in_card_set as usize);
        let max_arrays_bytes = bitmap_bytes / 2;
        let array_bytes = max_cards_in_array as usize * std::mem::size_of::<CardEntry>();
        let num_arrays = (max_arrays_bytes / array_bytes.max(1)).max(1);
        let buckets = (num_arrays.min(max_buckets as usize) as u32).next_power_of_two();
        if buckets as usize > num_arrays.min(max_buckets as usize) {
            buckets >> 1
        } else {
            buckets
        }
    }

    fn log_configuration(&self) {
        debug!(
            "card set container configuration: \
             inline #cards {} array #cards {} \
             howl #buckets {} coarsen threshold {} \
             howl bitmap #cards {} coarsen threshold {} \
             card regions per heap region {} cards per card region {}",
            self.max_cards_in_inline_ptr(),
            self.max_cards_in_array,
            self.num_buckets_in_howl,
            self.cards_in_howl_threshold,
            self.max_cards_in_howl_bitmap,
            self.cards_in_howl_bitmap_threshold,
            1u32 << self.log2_card_regions_per_heap_region,
            self.max_cards_in_card_set,
        );
    }

    pub fn inline_ptr_bits_per_card(&self) -> u32 {
        self.inline_ptr_bits_per_card
    }

    pub fn max_cards_in_inline_ptr(&self) -> u32 {
        containers::max_cards_in_inline_ptr(self.inline_ptr_bits_per_card)
    }

    pub fn max_cards_in_array(&self) -> u32 {
        self.max_cards_in_array
    }

    pub fn num_buckets_in_howl(&self) -> u32 {
        self.num_buckets_in_howl
    }

    /// Cards per card region (the container address space).
    pub fn max_cards_in_region(&self) -> u32 {
        self.max_cards_in_card_set
    }

    pub fn cards_in_howl_threshold(&self) -> u32 {
        self.cards_in_howl_threshold
    }

    pub fn max_cards_in_howl_bitmap(&self) -> u32 {
        self.max_cards_in_howl_bitmap
    }

    pub fn cards_in_howl_bitmap_threshold(&self) -> u32 {
        self.cards_in_howl_bitmap_threshold
    }

    pub fn log2_max_cards_in_howl_bitmap(&self) -> u32 {
        self.log2_max_cards_in_howl_bitmap
    }

    pub fn howl_bucket_index(&self, card_in_region: u32) -> u32 {
        card_in_region >> self.log2_max_cards_in_howl_bitmap
    }

    pub fn howl_bitmap_offset(&self, card_in_region: u32) -> u32 {
        card_in_region & self.bitmap_hash_mask
    }

    pub fn log2_card_regions_per_heap_region(&self) -> u32 {
        self.log2_card_regions_per_heap_region
    }

    pub fn log2_cards_per_card_region(&self) -> u32 {
        self.log2_cards_per_card_region
    }

    /// Split a global card index into (card region, card within card
    /// region).
    pub fn split_card(&self, card: usize) -> (u32, u32) {
        let card_region = (card >> self.log2_cards_per_card_region) as u32;
        let card_in_region = (card & (self.max_cards_in_card_set as usize - 1)) as u32;
        (card_region, card_in_region)
    }

    /// Validate at startup that the whole heap's cards are addressable as a
    /// `(u32 card region, card within card region)` pair.
    pub fn check_heap_representable(&self, heap_bytes: usize) -> Result<(), String> {
        let heap_size_bits = heap_bytes.next_power_of_two().ilog2();
        let available_bits =
            32 + self.log2_cards_per_card_region + LOG_BYTES_IN_CARD as u32;
        if heap_size_bits > available_bits {
            return Err(format!(
                "cannot represent all cards in the heap: heap {heap_bytes}B ({heap_size_bits} bits), \
                 card set only covers {available_bits} bits; decrease heap size"
            ));
        }
        Ok(())
    }
}

/// The geometry most scenario tests use: 2048-card regions, 8-entry arrays,
/// 8 howl buckets with 256-card bitmaps.
#[cfg(test)]
pub(crate) fn small_config() -> CardSetConfig {
    CardSetConfig::with_geometry(8, 78, 8, 78, 2048, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_geometry() {
        let config = small_config();
        assert_eq!(config.num_buckets_in_howl(), 8);
        assert_eq!(config.max_cards_in_howl_bitmap(), 256);
        assert_eq!(config.inline_ptr_bits_per_card(), 11);
        // (64 - 2 tag bits - 4 size bits) / 11 bits per card
        assert_eq!(config.max_cards_in_inline_ptr(), 5);
        assert_eq!(config.cards_in_howl_threshold(), 2048 * 78 / 100);
        assert_eq!(config.cards_in_howl_bitmap_threshold(), 256 * 78 / 100);
    }

    #[test]
    fn bucket_indexing() {
        let config = small_config();
        assert_eq!(config.howl_bucket_index(0), 0);
        assert_eq!(config.howl_bucket_index(255), 0);
        assert_eq!(config.howl_bucket_index(256), 1);
        assert_eq!(config.howl_bitmap_offset(256), 0);
        assert_eq!(config.howl_bitmap_offset(511), 255);
    }

    #[test]
    fn split_card_round_trips() {
        let config = small_config();
        let (region, card) = config.split_card(3 * 2048 + 77);
        assert_eq!((region, card), (3, 77));
    }

    #[test]
    fn virtualizes_large_regions() {
        // 2^17 cards per heap region exceeds the per-container limit, so the
        // region is split into two card regions.
        let config = CardSetConfig::new(17, 32, 90, 8, 90, );
        assert_eq!(config.log2_card_regions_per_heap_region(), 1);
        assert_eq!(config.max_cards_in_region(), 1 << 16);
        assert_eq!(
            config.log2_card_regions_per_heap_region() + config.log2_cards_per_card_region(),
            17
        );
    }

    #[test]
    fn heap_representability() {
        let config = small_config();
        assert!(config.check_heap_representable(1 << 40).is_ok());
        assert!(config.check_heap_representable(usize::MAX).is_err());
    }
}
