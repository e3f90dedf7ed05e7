mod replicator;
mod storage;
mod table;

pub use replicator::*;
pub use storage::*;
pub use table::*;

use thiserror::Error;

/// Validation failure for a configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
