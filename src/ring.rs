//! Ring Buffer Store
//!
//! Fixed-capacity circular storage for raw samples, one ring per collection
//! kind. A tick always lands in `slot = tick % capacity`, overwriting whatever
//! was there; only the most recent `capacity` ticks are ever visible.
//!
//! # Components
//!
//! - [`Ring`]: slot arena for a single collection kind
//! - [`RingStore`]: per-kind registry of rings
//! - [`SampleHeader`] / [`DetailRow`]: the payload written into a slot

mod buffer;
mod slot;
mod store;

pub use buffer::{MAX_CAPACITY, MIN_CAPACITY, Ring, RingError, WriteReceipt};
pub use slot::{DetailRow, HeaderRow, RingEntry, SampleHeader, SampleMeta};
pub use store::RingStore;
