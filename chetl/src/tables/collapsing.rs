use chetl_config::shared::TruncateMode;
use chetl_postgres::types::{Lsn, Row};

use crate::destination::Warehouse;
use crate::error::ChetlResult;
use crate::replication::source::SnapshotStream;
use crate::tables::base::GenericTable;

/// Collapsing table engine.
///
/// Every logical row carries a sign: an update writes the old row with `-1`
/// followed by the new row with `+1`, a delete writes the old row with `-1`.
/// The target materializes the latest row per key by summing signs.
pub struct CollapsingTable<W: Warehouse> {
    generic: GenericTable<W>,
}

impl<W: Warehouse> CollapsingTable<W> {
    pub(crate) fn new(generic: GenericTable<W>) -> CollapsingTable<W> {
        CollapsingTable { generic }
    }

    pub(crate) fn generic(&self) -> &GenericTable<W> {
        &self.generic
    }

    pub(crate) fn generic_mut(&mut self) -> &mut GenericTable<W> {
        &mut self.generic
    }

    pub(crate) fn insert(&mut self, new_row: &Row) -> ChetlResult<()> {
        self.generic.write_row(new_row, Some(1))
    }

    pub(crate) fn update(&mut self, old_row: Option<&Row>, new_row: &Row) -> ChetlResult<()> {
        if let Some(old_row) = old_row {
            self.generic.write_row(old_row, Some(-1))?;
        }
        self.generic.write_row(new_row, Some(1))
    }

    pub(crate) fn delete(&mut self, old_row: &Row) -> ChetlResult<()> {
        self.generic.write_row(old_row, Some(-1))
    }

    pub(crate) fn truncate(&mut self) {
        match self.generic.truncate_mode() {
            TruncateMode::TargetSide => self.generic.truncate_target_side(),
            TruncateMode::Tombstones => self.generic.truncate_tombstones(),
        }
    }

    pub(crate) async fn sync<T: SnapshotStream>(
        &mut self,
        snapshot: &mut T,
        snapshot_lsn: Lsn,
    ) -> ChetlResult<()> {
        self.generic.sync(snapshot, snapshot_lsn, Some(1)).await
    }
}
