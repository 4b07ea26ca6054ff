//! Remembered-set and concurrent refinement engine for a region-partitioned
//! generational garbage collector.
//!
//! The heap is divided into fixed-size regions; a stop-the-world pause
//! evacuates only a subset of them (the collection set). To find all
//! pointers into the collection set without scanning the whole heap, each
//! region maintains a remembered set: a conservative, lock-free,
//! adaptively coarsening set of card indices ([`cardset`]). Mutator write
//! barriers dirty cards in a pair of byte-per-card tables ([`heap`]);
//! background refinement drains those cards into the remembered sets
//! ([`refine`]); the pause merges every remaining source onto one card
//! table snapshot and scans it in parallel ([`gc`]); and collection set
//! finalization decides which old regions each pause evacuates ([`cset`]).
//!
//! The tracing and copying machinery of the embedding collector stays
//! outside this crate: object parsing enters through
//! [`heap::ObjectScanner`], pause predictions through [`policy::Policy`],
//! and discovered collection set roots leave through
//! [`gc::EvacuationSink`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod util;
pub mod cardset;
pub mod cset;
pub mod gc;
pub mod heap;
pub mod policy;
pub mod refine;
pub mod scheduler;
pub mod vm;

#[cfg(test)]
mod tests;

pub use crate::cardset::containers::AddResult;
pub use crate::cardset::rem_set::{RegionRemSet, RemSetState};
pub use crate::cset::CollectionSet;
pub use crate::gc::HeapRemSet;
pub use crate::heap::{Heap, ObjectScanner, Region, RegionKind};
pub use crate::policy::Policy;
pub use crate::refine::ConcurrentRefine;
pub use crate::util::options::Options;
pub use crate::util::{Address, MemRegion};
