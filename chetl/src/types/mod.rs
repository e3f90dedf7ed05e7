//! Types shared across the pipeline.
//!
//! Re-exports the Postgres domain types and wire messages so downstream code
//! only depends on the `chetl` crate.

pub use chetl_postgres::replication::protocol::*;
pub use chetl_postgres::types::*;
