//! Contracts to the source database.
//!
//! The connection, authentication and SQL plumbing towards the source are
//! collaborators outside the pipeline core; the engine and the snapshot
//! workers consume them through these traits.

use std::future::Future;

use bytes::Bytes;
use chetl_postgres::types::{ColumnSchema, Lsn, TableName};

use crate::error::ChetlResult;

/// Feedback channel of the replication stream.
///
/// Records the confirmed LSN that the stream reports back to the source.
/// The engine only advances it once every table touched by a commit has
/// flushed and recorded its position, so a restart resumes without loss.
pub trait WalConsumer: Send + Sync {
    /// Advances the confirmed LSN. Values lower than the current position
    /// must be ignored by the implementation.
    fn advance_lsn(&self, lsn: Lsn);
}

/// Source-side services used by the snapshot phase.
pub trait SnapshotSource: Clone + Send + Sync + 'static {
    type Conn: SnapshotConnection;

    /// Opens a dedicated source connection for one snapshot worker.
    fn connect(&self) -> impl Future<Output = ChetlResult<Self::Conn>> + Send;

    /// Returns the estimated live row count of a table, used to start long
    /// tables first.
    fn estimate_live_tuples(
        &self,
        table: &TableName,
    ) -> impl Future<Output = ChetlResult<u64>> + Send;
}

/// One snapshot worker's connection to the source.
pub trait SnapshotConnection: Send {
    type Snapshot: SnapshotStream + Send;

    /// Opens a read-only `REPEATABLE READ` transaction, creates a temporary
    /// logical replication slot inside it and returns the consistent
    /// point-in-time copy stream of `table`.
    ///
    /// Failures are retried by the caller; the temporary slot is dropped
    /// with the transaction.
    fn begin_snapshot(
        &mut self,
        table: &TableName,
    ) -> impl Future<Output = ChetlResult<Self::Snapshot>> + Send;
}

/// A consistent point-in-time copy of one table.
pub trait SnapshotStream: Send {
    /// The consistent-point LSN captured when the temporary slot was
    /// created.
    fn snapshot_lsn(&self) -> Lsn;

    /// Column schemas of the copied table, in copy-stream column order.
    fn column_schemas(&self) -> &[ColumnSchema];

    /// Returns the next line of the text copy stream, or `None` at the end
    /// of the table.
    fn next_line(&mut self) -> impl Future<Output = ChetlResult<Option<Bytes>>> + Send;

    /// Commits the transaction, dropping the temporary slot.
    fn commit(self) -> impl Future<Output = ChetlResult<()>> + Send;
}
