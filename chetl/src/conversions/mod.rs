//! Conversion seams between source values and target columns.

pub mod copy;

use chetl_postgres::types::{ColumnSchema, Tuple, TupleKind};

use crate::bail;
use crate::error::{ChetlResult, ErrorKind};

/// Literal written for SQL NULL in the outbound tab-separated stream.
pub const NULL_LITERAL: &[u8] = b"\\N";

/// Converts one source column value into its target representation.
///
/// The concrete conversion rules (Postgres type to warehouse type) are a
/// collaborator outside the pipeline core; the core only routes every value
/// through this seam, in column order.
pub trait ColumnConverter: Send + Sync {
    /// Appends the target-format bytes of `tuple` to `out`.
    ///
    /// `Unchanged` tuples never reach a converter: the engine masks them out
    /// of update old-rows before buffering.
    fn convert(&self, out: &mut Vec<u8>, column: &ColumnSchema, tuple: &Tuple) -> ChetlResult<()>;
}

/// Pass-through converter.
///
/// Forwards the source text bytes unchanged and writes `\N` for NULL. The
/// source's text escaping is compatible with the warehouse's tab-separated
/// input, which is what makes pass-through viable; richer type mapping lives
/// behind the same trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextConverter;

impl ColumnConverter for TextConverter {
    fn convert(&self, out: &mut Vec<u8>, column: &ColumnSchema, tuple: &Tuple) -> ChetlResult<()> {
        match tuple.kind {
            TupleKind::Text => out.extend_from_slice(&tuple.value),
            TupleKind::Null => out.extend_from_slice(NULL_LITERAL),
            TupleKind::Unchanged => bail!(
                ErrorKind::InvalidState,
                "Unchanged tuple reached the column converter",
                column.name
            ),
        }

        Ok(())
    }
}
