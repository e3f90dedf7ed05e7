//! Configuration types and loading for the chetl replication pipeline.

pub mod environment;
pub mod load;
pub mod shared;
