use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chetl_postgres::types::{ColumnSchema, Lsn, TableName};

use crate::chetl_error;
use crate::error::{ChetlResult, ErrorKind};
use crate::replication::source::{
    SnapshotConnection, SnapshotSource, SnapshotStream, WalConsumer,
};

/// Records every confirmed-LSN advancement, ignoring regressions the way a
/// real stream consumer does.
#[derive(Debug, Default)]
pub struct MemoryWalConsumer {
    history: Mutex<Vec<Lsn>>,
}

impl MemoryWalConsumer {
    pub fn new() -> MemoryWalConsumer {
        MemoryWalConsumer::default()
    }

    /// The most recently confirmed LSN.
    pub fn confirmed_lsn(&self) -> Lsn {
        self.history
            .lock()
            .expect("wal consumer lock poisoned")
            .last()
            .copied()
            .unwrap_or(Lsn::INVALID)
    }

    /// Every confirmed LSN, in confirmation order.
    pub fn history(&self) -> Vec<Lsn> {
        self.history
            .lock()
            .expect("wal consumer lock poisoned")
            .clone()
    }
}

impl WalConsumer for MemoryWalConsumer {
    fn advance_lsn(&self, lsn: Lsn) {
        let mut history = self.history.lock().expect("wal consumer lock poisoned");
        if history.last().is_none_or(|last| lsn > *last) {
            history.push(lsn);
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryTableData {
    columns: Vec<ColumnSchema>,
    lines: Vec<Bytes>,
    snapshot_lsn: Lsn,
    estimate: u64,
}

#[derive(Debug, Default)]
struct SourceInner {
    tables: Mutex<HashMap<TableName, MemoryTableData>>,
    slot_failures_remaining: AtomicU32,
}

/// In-memory snapshot source.
///
/// Tables are seeded with pre-encoded copy lines and a snapshot LSN;
/// `fail_slot_creation` makes the next N slot creations fail to exercise
/// the retry path.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotSource {
    inner: Arc<SourceInner>,
}

impl MemorySnapshotSource {
    pub fn new() -> MemorySnapshotSource {
        MemorySnapshotSource::default()
    }

    /// Seeds one table's copy stream.
    pub fn set_table(
        &self,
        name: TableName,
        columns: Vec<ColumnSchema>,
        lines: Vec<Bytes>,
        snapshot_lsn: Lsn,
    ) {
        let estimate = lines.len() as u64;
        self.inner
            .tables
            .lock()
            .expect("snapshot source lock poisoned")
            .insert(
                name,
                MemoryTableData {
                    columns,
                    lines,
                    snapshot_lsn,
                    estimate,
                },
            );
    }

    /// Makes the next `count` slot creations fail.
    pub fn fail_slot_creation(&self, count: u32) {
        self.inner
            .slot_failures_remaining
            .store(count, Ordering::SeqCst);
    }
}

impl SnapshotSource for MemorySnapshotSource {
    type Conn = MemorySnapshotConnection;

    async fn connect(&self) -> ChetlResult<MemorySnapshotConnection> {
        Ok(MemorySnapshotConnection {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn estimate_live_tuples(&self, table: &TableName) -> ChetlResult<u64> {
        Ok(self
            .inner
            .tables
            .lock()
            .expect("snapshot source lock poisoned")
            .get(table)
            .map(|data| data.estimate)
            .unwrap_or(0))
    }
}

/// One worker's connection to the in-memory source.
#[derive(Debug)]
pub struct MemorySnapshotConnection {
    inner: Arc<SourceInner>,
}

impl SnapshotConnection for MemorySnapshotConnection {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&mut self, table: &TableName) -> ChetlResult<MemorySnapshot> {
        let failures = &self.inner.slot_failures_remaining;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(chetl_error!(
                ErrorKind::SlotCreationFailed,
                "Injected slot creation failure",
                table.clone()
            ));
        }

        let data = self
            .inner
            .tables
            .lock()
            .expect("snapshot source lock poisoned")
            .get(table)
            .cloned()
            .ok_or_else(|| {
                chetl_error!(
                    ErrorKind::SourceError,
                    "Unknown table in snapshot source",
                    table.clone()
                )
            })?;

        Ok(MemorySnapshot {
            snapshot_lsn: data.snapshot_lsn,
            columns: data.columns,
            lines: data.lines.into(),
        })
    }
}

/// A seeded point-in-time copy of one table.
#[derive(Debug)]
pub struct MemorySnapshot {
    snapshot_lsn: Lsn,
    columns: Vec<ColumnSchema>,
    lines: VecDeque<Bytes>,
}

impl SnapshotStream for MemorySnapshot {
    fn snapshot_lsn(&self) -> Lsn {
        self.snapshot_lsn
    }

    fn column_schemas(&self) -> &[ColumnSchema] {
        &self.columns
    }

    async fn next_line(&mut self) -> ChetlResult<Option<Bytes>> {
        Ok(self.lines.pop_front())
    }

    async fn commit(self) -> ChetlResult<()> {
        Ok(())
    }
}
