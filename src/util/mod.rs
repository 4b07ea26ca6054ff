//! Shared utilities: addresses, constants, options, logging and the
//! grace-period machinery used by the card set containers.

mod address;
pub mod constants;
pub mod epoch;
pub(crate) mod logger;
pub mod options;

pub use address::{Address, MemRegion};
