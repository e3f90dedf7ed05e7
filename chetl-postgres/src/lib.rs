//! Postgres-side building blocks for the chetl replication pipeline.
//!
//! This crate contains the domain types shared between the decoding layer and
//! the replication engine (LSNs, relation schemas, tuples) together with the
//! binary decoder for the logical replication wire protocol.

pub mod replication;
pub mod types;
