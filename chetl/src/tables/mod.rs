//! Per-table buffers between the replication stream and the warehouse.
//!
//! A buffer accumulates encoded rows for one target table between flushes.
//! The two engine flavors share the [`base`] row plumbing and differ in how
//! they express updates, deletes and truncates.

mod append;
mod base;
mod collapsing;

pub use append::*;
pub use base::*;
pub use collapsing::*;
