//! Core of the chetl replication pipeline.
//!
//! Streams row-level changes from Postgres logical replication into a
//! columnar warehouse: an initial parallel snapshot per table followed by
//! continuous application of inserts, updates, deletes and truncates,
//! preserving transaction boundaries and advancing the source WAL position
//! only after the affected tables have durably flushed.

pub mod concurrency;
pub mod conversions;
pub mod destination;
pub mod error;
pub mod macros;
pub mod metrics;
pub mod pipeline;
pub mod replication;
pub mod state;
pub mod tables;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
