//! Pipeline orchestration.
//!
//! Builds the per-table buffers from configuration, decides which tables
//! need an initial snapshot, runs the snapshot pool, starts the inactivity
//! flusher and hands the caller the streaming-phase engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chetl_config::shared::ReplicatorConfig;
use chetl_postgres::types::{Lsn, TableName};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chetl_error;
use crate::concurrency::errors::{ErrorRx, ErrorTx, error_channel};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown};
use crate::conversions::ColumnConverter;
use crate::destination::Warehouse;
use crate::error::{ChetlResult, ErrorKind};
use crate::metrics::register_metrics;
use crate::replication::apply::{ApplyEngine, EngineShared, TableState};
use crate::replication::source::{SnapshotSource, WalConsumer};
use crate::replication::state::{Lifecycle, LifecycleState};
use crate::state::store::StateStore;
use crate::tables::{TableBuffer, UploadOptions};
use crate::workers::flush::InactivityFlusher;
use crate::workers::table_sync::TableSyncPool;

enum PipelineState {
    Created,
    Started { flusher: JoinHandle<()> },
}

/// The replication pipeline.
///
/// Owns the shared engine state and the background workers. The caller
/// drives the streaming phase by feeding decoded records into the
/// [`ApplyEngine`] returned by [`Pipeline::start`]; the source and
/// warehouse transports are supplied through their contract traits.
pub struct Pipeline<W: Warehouse, S: SnapshotSource> {
    config: Arc<ReplicatorConfig>,
    source: S,
    shared: Arc<EngineShared<W>>,
    err_tx: ErrorTx,
    err_rx: Option<ErrorRx>,
    shutdown_tx: ShutdownTx,
    state: PipelineState,
}

impl<W: Warehouse, S: SnapshotSource> Pipeline<W, S> {
    /// Creates a pipeline from configuration and collaborators.
    ///
    /// Loads every configured table's flush position from the checkpoint
    /// store; a corrupt stored value is fatal here and the value is left
    /// untouched for inspection.
    pub fn new(
        config: ReplicatorConfig,
        source: S,
        warehouse: W,
        store: Arc<dyn StateStore>,
        consumer: Arc<dyn WalConsumer>,
        converter: Arc<dyn ColumnConverter>,
    ) -> ChetlResult<Pipeline<W, S>> {
        config.validate()?;
        register_metrics();

        let config = Arc::new(config);
        let upload = UploadOptions::from_config(&config);

        let mut tables = HashMap::new();
        for (key, table_config) in &config.tables {
            let name = parse_table_key(key)?;

            let last_flushed_lsn = if store.has(key) {
                store.read_lsn(key)?
            } else {
                Lsn::INVALID
            };

            let buffer = TableBuffer::new(
                name.clone(),
                table_config.clone(),
                warehouse.clone(),
                Arc::clone(&store),
                Arc::clone(&converter),
                upload.clone(),
            )?;

            tables.insert(
                name,
                Arc::new(Mutex::new(TableState {
                    buffer,
                    last_flushed_lsn,
                })),
            );
        }

        let shared = Arc::new(EngineShared::new(
            tables,
            Lifecycle::new(),
            store,
            consumer,
        ));
        let (err_tx, err_rx) = error_channel();
        let (shutdown_tx, _shutdown_rx) = create_shutdown();

        Ok(Pipeline {
            config,
            source,
            shared,
            err_tx,
            err_rx: Some(err_rx),
            shutdown_tx,
            state: PipelineState::Created,
        })
    }

    /// Starts the pipeline: snapshots tables without a recorded position,
    /// then spawns the inactivity flusher and returns the streaming engine.
    ///
    /// Streaming must only begin after this returns; each table's starting
    /// LSN is individually recorded, so the engine drops every record at or
    /// below it.
    pub async fn start(&mut self) -> ChetlResult<ApplyEngine<W>> {
        info!(tables = self.shared.tables.len(), "starting replication pipeline");

        let tables_to_sync = self.tables_to_sync().await?;

        if tables_to_sync.is_empty() {
            self.shared.lifecycle.store(LifecycleState::Working);
        } else {
            self.shared.lifecycle.store(LifecycleState::Syncing);

            for name in &tables_to_sync {
                let shared_table = self.shared.tables.get(name).cloned().ok_or_else(|| {
                    chetl_error!(
                        ErrorKind::InvalidState,
                        "Sync scheduled for an unknown table",
                        name.clone()
                    )
                })?;
                shared_table.lock().await.buffer.init_sync().await?;
            }

            let pool = TableSyncPool::new(
                Arc::clone(&self.shared),
                self.source.clone(),
                Arc::clone(&self.config),
                self.shutdown_tx.subscribe(),
            );
            pool.run(tables_to_sync).await?;

            self.shared.lifecycle.store(LifecycleState::Working);
        }

        let flusher = InactivityFlusher::new(
            Arc::clone(&self.shared),
            self.err_tx.clone(),
            Duration::from_millis(self.config.inactivity_flush_timeout_ms),
            self.shutdown_tx.subscribe(),
        )
        .start();
        self.state = PipelineState::Started { flusher };

        Ok(ApplyEngine::new(
            Arc::clone(&self.shared),
            self.err_tx.clone(),
        ))
    }

    /// Tables present in configuration but without a valid recorded LSN,
    /// ordered by descending estimated row count so long tables start
    /// first.
    async fn tables_to_sync(&self) -> ChetlResult<Vec<TableName>> {
        let mut tables = Vec::new();
        let mut estimates: HashMap<TableName, u64> = HashMap::new();

        for (key, table_config) in &self.config.tables {
            if table_config.init_sync_skip {
                continue;
            }

            let name = parse_table_key(key)?;

            if self.shared.store.has(key) && self.shared.store.read_lsn(key)?.is_valid() {
                continue;
            }

            let estimate = self.source.estimate_live_tuples(&name).await?;
            estimates.insert(name.clone(), estimate);
            tables.push(name);
        }

        tables.sort_by(|a, b| estimates[b].cmp(&estimates[a]));

        info!(count = tables.len(), "tables needing initial sync");

        Ok(tables)
    }

    /// Current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.shared.lifecycle.load()
    }

    /// Takes the receiving half of the pipeline error channel.
    pub fn take_error_receiver(&mut self) -> Option<ErrorRx> {
        self.err_rx.take()
    }

    /// Subscribes to the pipeline shutdown signal, for the stream-reading
    /// loop to observe between messages.
    pub fn subscribe_shutdown(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    /// Signals shutdown and joins the background workers.
    pub async fn shutdown_and_wait(&mut self) -> ChetlResult<()> {
        info!("shutting down replication pipeline");

        self.shared.lifecycle.store(LifecycleState::ShuttingDown);
        self.shutdown_tx.shutdown();

        if let PipelineState::Started { flusher } =
            std::mem::replace(&mut self.state, PipelineState::Created)
        {
            if let Err(join_error) = flusher.await {
                warn!(%join_error, "inactivity flusher did not stop cleanly");
            }
        }

        self.shared.store.close()?;

        Ok(())
    }
}

fn parse_table_key(key: &str) -> ChetlResult<TableName> {
    match key.split_once('.') {
        Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
            Ok(TableName::new(schema, name))
        }
        _ => Err(chetl_error!(
            ErrorKind::ConfigurationError,
            "Table keys must be of the form schema.name",
            key
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_key() {
        assert_eq!(
            parse_table_key("public.users").unwrap(),
            TableName::new("public", "users")
        );
        assert!(parse_table_key("users").is_err());
        assert!(parse_table_key(".users").is_err());
        assert!(parse_table_key("public.").is_err());
    }
}
