//! Heap regions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize};
use std::sync::Arc;

use atomic::Ordering;

use crate::cardset::config::CardSetConfig;
use crate::cardset::from_card_cache::FromCardCache;
use crate::cardset::rem_set::RegionRemSet;
use crate::util::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionKind {
    Free = 0,
    Eden = 1,
    Survivor = 2,
    Old = 3,
    HumongousStart = 4,
    HumongousCont = 5,
}

impl RegionKind {
    fn from_u8(raw: u8) -> RegionKind {
        match raw {
            0 => RegionKind::Free,
            1 => RegionKind::Eden,
            2 => RegionKind::Survivor,
            3 => RegionKind::Old,
            4 => RegionKind::HumongousStart,
            _ => RegionKind::HumongousCont,
        }
    }
}

/// One fixed-size heap region: the allocation and evacuation unit.
///
/// Only the state this crate consumes is modeled; allocation and object
/// layout belong to the embedding collector.
pub struct Region {
    index: u32,
    bottom: Address,
    end: Address,
    kind: AtomicU8,
    /// Current allocation top. Stable for old and humongous regions
    /// outside safepoints, which is what makes refinement's scan limit
    /// sound.
    top: AtomicUsize,
    pin_count: AtomicUsize,
    in_collection_set: AtomicBool,
    /// Position in the optional collection set, `u32::MAX` when absent.
    index_in_opt_cset: AtomicU32,
    rem_set: RegionRemSet,
}

const NO_OPT_CSET_INDEX: u32 = u32::MAX;

impl Region {
    pub fn new(
        index: u32,
        bottom: Address,
        end: Address,
        config: Arc<CardSetConfig>,
        from_card_cache: Arc<FromCardCache>,
        heap_base: Address,
    ) -> Region {
        Region {
            index,
            bottom,
            end,
            kind: AtomicU8::new(RegionKind::Free as u8),
            top: AtomicUsize::new(bottom.as_usize()),
            pin_count: AtomicUsize::new(0),
            in_collection_set: AtomicBool::new(false),
            index_in_opt_cset: AtomicU32::new(NO_OPT_CSET_INDEX),
            rem_set: RegionRemSet::new(index, config, from_card_cache, heap_base),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bottom(&self) -> Address {
        self.bottom
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn top(&self) -> Address {
        Address::from_usize(self.top.load(Ordering::Acquire))
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(self.bottom <= top && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Change the region kind. Regions change kind only at allocation or
    /// at safepoints.
    pub fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    pub fn is_young(&self) -> bool {
        matches!(self.kind(), RegionKind::Eden | RegionKind::Survivor)
    }

    pub fn is_old(&self) -> bool {
        self.kind() == RegionKind::Old
    }

    pub fn is_humongous(&self) -> bool {
        matches!(self.kind(), RegionKind::HumongousStart | RegionKind::HumongousCont)
    }

    pub fn is_old_or_humongous(&self) -> bool {
        self.is_old() || self.is_humongous()
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0, "unbalanced unpin of region {}", self.index);
    }

    pub fn has_pinned_objects(&self) -> bool {
        self.pin_count.load(Ordering::Relaxed) > 0
    }

    pub fn in_collection_set(&self) -> bool {
        self.in_collection_set.load(Ordering::Acquire)
    }

    pub fn set_in_collection_set(&self, value: bool) {
        self.in_collection_set.store(value, Ordering::Release);
    }

    pub fn set_index_in_opt_cset(&self, index: u32) {
        debug_assert!(index != NO_OPT_CSET_INDEX);
        self.index_in_opt_cset.store(index, Ordering::Relaxed);
    }

    pub fn clear_index_in_opt_cset(&self) {
        self.index_in_opt_cset.store(NO_OPT_CSET_INDEX, Ordering::Relaxed);
    }

    pub fn has_index_in_opt_cset(&self) -> bool {
        self.index_in_opt_cset.load(Ordering::Relaxed) != NO_OPT_CSET_INDEX
    }

    pub fn rem_set(&self) -> &RegionRemSet {
        &self.rem_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardset::config;

    fn region() -> Region {
        let config = Arc::new(config::small_config());
        let fcc = Arc::new(FromCardCache::new(1, 4));
        Region::new(
            0,
            Address::from_usize(0x10_0000),
            Address::from_usize(0x20_0000),
            config,
            fcc,
            Address::ZERO,
        )
    }

    #[test]
    fn kind_and_predicates() {
        let r = region();
        assert!(r.is_free());
        r.set_kind(RegionKind::Eden);
        assert!(r.is_young() && !r.is_old_or_humongous());
        r.set_kind(RegionKind::HumongousStart);
        assert!(r.is_humongous() && r.is_old_or_humongous());
    }

    #[test]
    fn pin_counting() {
        let r = region();
        assert!(!r.has_pinned_objects());
        r.pin();
        r.pin();
        r.unpin();
        assert!(r.has_pinned_objects());
        r.unpin();
        assert!(!r.has_pinned_objects());
    }

    #[test]
    fn top_bounds() {
        let r = region();
        assert_eq!(r.top(), r.bottom());
        let mid = r.bottom() + 0x8000;
        r.set_top(mid);
        assert_eq!(r.top(), mid);
    }
}
