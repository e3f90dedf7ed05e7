use chetl_postgres::types::{Lsn, Row};
use tracing::debug;

use crate::destination::Warehouse;
use crate::error::ChetlResult;
use crate::replication::source::SnapshotStream;
use crate::tables::base::GenericTable;

/// Append-only table engine.
///
/// The target engine does not model updates or deletes, so both are dropped;
/// a per-table counter tracks how many were skipped.
pub struct AppendTable<W: Warehouse> {
    generic: GenericTable<W>,
    dropped_updates: u64,
    dropped_deletes: u64,
}

impl<W: Warehouse> AppendTable<W> {
    pub(crate) fn new(generic: GenericTable<W>) -> AppendTable<W> {
        AppendTable {
            generic,
            dropped_updates: 0,
            dropped_deletes: 0,
        }
    }

    pub(crate) fn generic(&self) -> &GenericTable<W> {
        &self.generic
    }

    pub(crate) fn generic_mut(&mut self) -> &mut GenericTable<W> {
        &mut self.generic
    }

    pub(crate) fn insert(&mut self, new_row: &Row) -> ChetlResult<()> {
        self.generic.write_row(new_row, None)
    }

    pub(crate) fn update(&mut self, _old_row: Option<&Row>, _new_row: &Row) -> ChetlResult<()> {
        self.dropped_updates += 1;
        debug!(
            table = %self.generic.name(),
            dropped = self.dropped_updates,
            "append engine dropped an update"
        );
        Ok(())
    }

    pub(crate) fn delete(&mut self, _old_row: &Row) -> ChetlResult<()> {
        self.dropped_deletes += 1;
        debug!(
            table = %self.generic.name(),
            dropped = self.dropped_deletes,
            "append engine dropped a delete"
        );
        Ok(())
    }

    pub(crate) fn truncate(&mut self) {
        // Without a sign column the only way to express a truncate is on the
        // target side.
        self.generic.truncate_target_side();
    }

    pub(crate) async fn sync<T: SnapshotStream>(
        &mut self,
        snapshot: &mut T,
        snapshot_lsn: Lsn,
    ) -> ChetlResult<()> {
        self.generic.sync(snapshot, snapshot_lsn, None).await
    }

    /// Number of updates dropped since startup.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    /// Number of deletes dropped since startup.
    pub fn dropped_deletes(&self) -> u64 {
        self.dropped_deletes
    }
}
