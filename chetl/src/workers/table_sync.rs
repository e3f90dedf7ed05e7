//! Snapshot worker pool.
//!
//! Runs the initial parallel load: a fixed number of workers pull tables
//! from a shared queue, each over its own source connection. A table sync
//! opens a repeatable-read transaction with a temporary replication slot,
//! streams the whole table through the copy decoder into the warehouse and
//! records the slot's consistent-point LSN as the table's starting position.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chetl_config::shared::ReplicatorConfig;
use chetl_postgres::types::TableName;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::destination::Warehouse;
use crate::error::{ChetlResult, ErrorKind};
use crate::replication::apply::EngineShared;
use crate::replication::source::{SnapshotConnection, SnapshotSource, SnapshotStream};
use crate::{bail, chetl_error};

/// The snapshot worker pool.
pub(crate) struct TableSyncPool<W: Warehouse, S: SnapshotSource> {
    shared: Arc<EngineShared<W>>,
    source: S,
    config: Arc<ReplicatorConfig>,
    shutdown_rx: ShutdownRx,
}

impl<W: Warehouse, S: SnapshotSource> TableSyncPool<W, S> {
    pub(crate) fn new(
        shared: Arc<EngineShared<W>>,
        source: S,
        config: Arc<ReplicatorConfig>,
        shutdown_rx: ShutdownRx,
    ) -> TableSyncPool<W, S> {
        TableSyncPool {
            shared,
            source,
            config,
            shutdown_rx,
        }
    }

    /// Runs the pool to completion over the given tables.
    ///
    /// Returns the first worker error, if any; the remaining workers are
    /// still joined so no task outlives the pool.
    pub(crate) async fn run(self, tables: Vec<TableName>) -> ChetlResult<()> {
        if tables.is_empty() {
            info!("no tables to sync");
            return Ok(());
        }

        info!(tables = tables.len(), workers = self.config.sync_workers, "starting initial sync");

        let queue = Arc::new(Mutex::new(VecDeque::from(tables)));
        let mut join_set = JoinSet::new();

        for worker_id in 0..self.config.sync_workers {
            join_set.spawn(sync_worker(
                worker_id,
                self.source.clone(),
                Arc::clone(&queue),
                Arc::clone(&self.shared),
                Arc::clone(&self.config),
                self.shutdown_rx.clone(),
            ));
        }

        let mut result = Ok(());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%error, "sync worker failed");
                    if result.is_ok() {
                        result = Err(error);
                    }
                }
                Err(join_error) => {
                    if result.is_ok() {
                        result = Err(chetl_error!(
                            ErrorKind::WorkerPanicked,
                            "Sync worker panicked",
                            join_error
                        ));
                    }
                }
            }
        }

        info!("initial sync finished");

        result
    }
}

async fn sync_worker<W: Warehouse, S: SnapshotSource>(
    worker_id: usize,
    source: S,
    queue: Arc<Mutex<VecDeque<TableName>>>,
    shared: Arc<EngineShared<W>>,
    config: Arc<ReplicatorConfig>,
    mut shutdown_rx: ShutdownRx,
) -> ChetlResult<()> {
    let mut conn = source.connect().await?;
    info!(worker = worker_id, "sync worker connected to source");

    loop {
        if shutdown_rx.is_shutdown() {
            info!(worker = worker_id, "sync worker cancelled");
            return Ok(());
        }

        let Some(table_name) = queue.lock().await.pop_front() else {
            break;
        };

        info!(worker = worker_id, table = %table_name, "starting table sync");
        sync_table(&mut conn, &table_name, &shared, &config, &shutdown_rx).await?;
        info!(worker = worker_id, table = %table_name, "table synced");

        if config.sync_sleep_secs > 0 {
            info!(worker = worker_id, secs = config.sync_sleep_secs, "sleeping between tables");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(config.sync_sleep_secs)) => {}
                _ = shutdown_rx.signaled() => return Ok(()),
            }
        }
    }

    info!(worker = worker_id, "sync worker finished");
    Ok(())
}

async fn sync_table<W: Warehouse, C: SnapshotConnection>(
    conn: &mut C,
    name: &TableName,
    shared: &Arc<EngineShared<W>>,
    config: &ReplicatorConfig,
    shutdown_rx: &ShutdownRx,
) -> ChetlResult<()> {
    let mut snapshot = None;
    for attempt in 1..=config.create_slot_max_attempts {
        // Cancellation between attempts leaves no partial LSN behind.
        if shutdown_rx.is_shutdown() {
            return Ok(());
        }

        match conn.begin_snapshot(name).await {
            Ok(opened) => {
                snapshot = Some(opened);
                break;
            }
            Err(error) => {
                warn!(
                    table = %name,
                    attempt,
                    %error,
                    "could not create a temporary replication slot"
                );
            }
        }
    }

    let Some(mut snapshot) = snapshot else {
        bail!(
            ErrorKind::SlotCreationFailed,
            "Temporary slot creation attempts exceeded",
            name.clone()
        );
    };

    let snapshot_lsn = snapshot.snapshot_lsn();

    let shared_table = shared.tables.get(name).cloned().ok_or_else(|| {
        chetl_error!(
            ErrorKind::InvalidState,
            "Sync requested for an unknown table",
            name.clone()
        )
    })?;

    // The worker owns the table for the whole copy; streaming for this
    // table only starts after the pool completes.
    let mut table = shared_table.lock().await;
    table.buffer.sync(&mut snapshot, snapshot_lsn).await?;
    table.last_flushed_lsn = snapshot_lsn;
    drop(table);

    // Committing drops the temporary slot.
    snapshot.commit().await?;

    Ok(())
}
