//! The replication engine.
//!
//! Consumes decoded logical replication records, drives the per-transaction
//! state machine, routes DML to the per-table buffers and advances the
//! source's confirmed LSN once everything a commit touched has durably
//! flushed.
//!
//! The transaction state lives behind one mutex whose owned guard is
//! acquired by `Begin` and released by `Commit`, so the inactivity flusher
//! can only run between transactions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chetl_postgres::types::{Lsn, Oid, Row, TableName, TupleKind};
use metrics::counter;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::concurrency::errors::ErrorTx;
use crate::destination::Warehouse;
use crate::error::{ChetlResult, ErrorKind};
use crate::metrics::CHETL_RECORDS_PROCESSED_TOTAL;
use crate::replication::source::WalConsumer;
use crate::replication::state::{Lifecycle, LifecycleState};
use crate::state::store::StateStore;
use crate::tables::TableBuffer;
use crate::types::{
    BeginBody, CommitBody, DeleteBody, InsertBody, LogicalMessage, RelationSchema, TruncateBody,
    UpdateBody,
};
use crate::{bail, chetl_error};

/// Interval of the stream throughput log line, in wall seconds.
const THROUGHPUT_LOG_INTERVAL_SECS: u64 = 5;

/// Per-table state owned by the engine.
pub(crate) struct TableState<W: Warehouse> {
    /// The buffer accumulating rows for the table.
    pub buffer: TableBuffer<W>,
    /// Highest LSN known to be durably flushed for this table. Loaded from
    /// the checkpoint store at startup, mutated only by a successful flush.
    pub last_flushed_lsn: Lsn,
}

/// A table shared between the engine, the flusher and one snapshot worker.
///
/// The streaming and snapshot phases are mutually exclusive per table; the
/// mutex makes that exclusivity explicit.
pub(crate) type SharedTable<W> = Arc<Mutex<TableState<W>>>;

/// Transaction-scoped state, guarded by the `in_tx` mutex.
#[derive(Debug)]
pub(crate) struct TxState {
    /// Commit LSN carried by `Begin`; invalid outside a transaction.
    pub final_lsn: Lsn,
    /// No DML has been applied in the open transaction yet.
    pub is_empty_tx: bool,
    /// Tables that received at least one DML in the open transaction.
    pub in_tx_tables: BTreeSet<TableName>,
    /// Tables whose buffers hold rows not yet written to the warehouse.
    pub tables_to_flush: BTreeSet<TableName>,
    /// Commit LSN of the most recently committed transaction.
    pub last_final_lsn: Lsn,
    /// OID bindings learned from relation messages.
    pub oid_map: HashMap<Oid, TableName>,
}

impl TxState {
    fn new() -> TxState {
        TxState {
            final_lsn: Lsn::INVALID,
            is_empty_tx: true,
            in_tx_tables: BTreeSet::new(),
            tables_to_flush: BTreeSet::new(),
            last_final_lsn: Lsn::INVALID,
            oid_map: HashMap::new(),
        }
    }
}

/// State shared between the engine, the inactivity flusher, the snapshot
/// pool and the pipeline.
pub(crate) struct EngineShared<W: Warehouse> {
    /// Configured tables; the map itself is immutable after startup.
    pub tables: HashMap<TableName, SharedTable<W>>,
    /// The `in_tx` mutex and the transaction-scoped state it guards.
    pub tx: Arc<Mutex<TxState>>,
    /// Pipeline lifecycle state.
    pub lifecycle: Lifecycle,
    /// Durable checkpoint store.
    pub store: Arc<dyn StateStore>,
    /// Confirmed-LSN feedback to the source.
    pub consumer: Arc<dyn WalConsumer>,
}

impl<W: Warehouse> EngineShared<W> {
    pub(crate) fn new(
        tables: HashMap<TableName, SharedTable<W>>,
        lifecycle: Lifecycle,
        store: Arc<dyn StateStore>,
        consumer: Arc<dyn WalConsumer>,
    ) -> EngineShared<W> {
        EngineShared {
            tables,
            tx: Arc::new(Mutex::new(TxState::new())),
            lifecycle,
            store,
            consumer,
        }
    }
}

/// The streaming-phase record processor.
///
/// Owned by the single stream-reading task; [`ApplyEngine::handle_record`]
/// is fed one decoded record at a time.
pub struct ApplyEngine<W: Warehouse> {
    shared: Arc<EngineShared<W>>,
    err_tx: ErrorTx,
    /// Held from `Begin` to `Commit`; its presence is the engine's
    /// definition of "a transaction is open".
    tx_guard: Option<OwnedMutexGuard<TxState>>,
    processed_records: u64,
    rate_window_started: Instant,
}

impl<W: Warehouse> ApplyEngine<W> {
    pub(crate) fn new(shared: Arc<EngineShared<W>>, err_tx: ErrorTx) -> ApplyEngine<W> {
        ApplyEngine {
            shared,
            err_tx,
            tx_guard: None,
            processed_records: 0,
            rate_window_started: Instant::now(),
        }
    }

    /// Processes one decoded replication record.
    ///
    /// On a fatal error the engine reports it on the error channel,
    /// transitions to shutdown and returns the error to the caller.
    pub async fn handle_record(&mut self, record: LogicalMessage) -> ChetlResult<()> {
        self.log_throughput();

        let result = self.dispatch(record).await;
        if let Err(err) = &result {
            error!(error = %err, "fatal replication error, shutting down");
            self.err_tx.send(chetl_error!(
                err.kind(),
                "Replication engine failed",
                err.to_string()
            ));
            self.abort_transaction();
            self.shared.lifecycle.store(LifecycleState::ShuttingDown);
        }

        result
    }

    /// Returns `true` while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx_guard.is_some()
    }

    async fn dispatch(&mut self, record: LogicalMessage) -> ChetlResult<()> {
        match record {
            LogicalMessage::Begin(body) => self.process_begin(body).await,
            // Catch-up noise before the first Begin is silently dropped.
            record if self.tx_guard.is_none() => {
                debug!(kind = record.kind_name(), "no open transaction, discarding record");
                Ok(())
            }
            LogicalMessage::Commit(body) => self.process_commit(body).await,
            LogicalMessage::Relation(relation) => self.process_relation(relation).await,
            LogicalMessage::Insert(body) => self.process_insert(body).await,
            LogicalMessage::Update(body) => self.process_update(body).await,
            LogicalMessage::Delete(body) => self.process_delete(body).await,
            LogicalMessage::Truncate(body) => self.process_truncate(body).await,
            LogicalMessage::Type(body) => {
                debug!(type_name = %body.name, "ignoring type metadata record");
                Ok(())
            }
            LogicalMessage::Origin(body) => {
                debug!(origin = %body.name, "ignoring origin record");
                Ok(())
            }
        }
    }

    async fn process_begin(&mut self, body: BeginBody) -> ChetlResult<()> {
        if self.shared.lifecycle.load() == LifecycleState::ShuttingDown {
            debug!("shutting down, discarding transaction");
            return Ok(());
        }

        if self.tx_guard.is_some() {
            bail!(
                ErrorKind::InvalidState,
                "Begin arrived while a transaction is already open",
                body.final_lsn
            );
        }

        debug!(final_lsn = %body.final_lsn, "begin, acquiring transaction lock");
        let mut guard = Arc::clone(&self.shared.tx).lock_owned().await;
        guard.final_lsn = body.final_lsn;
        guard.is_empty_tx = true;
        guard.in_tx_tables.clear();
        self.tx_guard = Some(guard);

        Ok(())
    }

    async fn process_commit(&mut self, body: CommitBody) -> ChetlResult<()> {
        let mut guard = self.tx_guard.take().ok_or_else(|| {
            chetl_error!(
                ErrorKind::InvalidState,
                "Commit arrived without an open transaction"
            )
        })?;

        let final_lsn = guard.final_lsn;
        if body.lsn != final_lsn {
            // Put the guard back so the error path resets consistently.
            self.tx_guard = Some(guard);
            bail!(
                ErrorKind::InvalidState,
                "Commit LSN does not match the open transaction",
                format!("{} != {}", body.lsn, final_lsn)
            );
        }

        if !guard.is_empty_tx {
            let in_tx_tables: Vec<TableName> = guard.in_tx_tables.iter().cloned().collect();
            for name in in_tx_tables {
                let shared_table = self.shared_table(&name)?;
                let mut table = shared_table.lock().await;

                let flushed = table.buffer.commit().await?;
                if flushed {
                    self.shared.store.write_lsn(&name.key_name(), final_lsn)?;
                    table.last_flushed_lsn = final_lsn;
                    guard.tables_to_flush.remove(&name);
                }
            }
        }

        debug!(
            final_lsn = %final_lsn,
            is_empty_tx = guard.is_empty_tx,
            pending_tables = guard.tables_to_flush.len(),
            "commit"
        );

        guard.in_tx_tables.clear();
        guard.last_final_lsn = final_lsn;

        // The confirmed LSN only advances once nothing the source sent is
        // still sitting in a buffer; otherwise the inactivity flusher
        // advances it after draining.
        if guard.tables_to_flush.is_empty() {
            self.shared.consumer.advance_lsn(final_lsn);
        }

        guard.final_lsn = Lsn::INVALID;
        drop(guard);

        Ok(())
    }

    async fn process_relation(&mut self, relation: RelationSchema) -> ChetlResult<()> {
        let name = relation.table_name();
        let Some(shared_table) = self.shared.tables.get(&name).cloned() else {
            debug!(table = %name, "relation message: discarding");
            return Ok(());
        };

        self.tx_mut()?.oid_map.insert(relation.oid, name.clone());

        let mut table = shared_table.lock().await;
        if let Some(existing) = table.buffer.relation()
            && !existing.same_structure(&relation)
        {
            bail!(
                ErrorKind::SchemaDrift,
                "Table structure has changed",
                name
            );
        }
        table.buffer.set_relation(relation)?;

        Ok(())
    }

    async fn process_insert(&mut self, body: InsertBody) -> ChetlResult<()> {
        let Some(shared_table) = self.check_and_get_table(body.relation_oid).await? else {
            debug!("insert message: discarding");
            return Ok(());
        };

        let mut table = shared_table.lock().await;
        table.buffer.insert(&body.new_row)?;
        drop(table);

        self.tx_mut()?.is_empty_tx = false;
        Ok(())
    }

    async fn process_update(&mut self, body: UpdateBody) -> ChetlResult<()> {
        let Some(shared_table) = self.check_and_get_table(body.relation_oid).await? else {
            debug!("update message: discarding");
            return Ok(());
        };

        // Unchanged placeholders mean "same as previous": substitute the new
        // row's value so no placeholder ever reaches a buffer.
        let masked_old = body
            .old_row
            .map(|old_row| mask_unchanged(old_row, &body.new_row));

        let mut table = shared_table.lock().await;
        table.buffer.update(masked_old.as_ref(), &body.new_row)?;
        drop(table);

        self.tx_mut()?.is_empty_tx = false;
        Ok(())
    }

    async fn process_delete(&mut self, body: DeleteBody) -> ChetlResult<()> {
        let Some(shared_table) = self.check_and_get_table(body.relation_oid).await? else {
            debug!("delete message: discarding");
            return Ok(());
        };

        let mut table = shared_table.lock().await;
        table.buffer.delete(&body.old_row)?;
        drop(table);

        self.tx_mut()?.is_empty_tx = false;
        Ok(())
    }

    async fn process_truncate(&mut self, body: TruncateBody) -> ChetlResult<()> {
        let mut touched = false;

        for oid in body.relation_oids {
            let Some(shared_table) = self.check_and_get_table(oid).await? else {
                debug!(oid, "truncate message: discarding table");
                continue;
            };

            let mut table = shared_table.lock().await;
            table.buffer.truncate();
            touched = true;
        }

        if touched {
            self.tx_mut()?.is_empty_tx = false;
        }
        Ok(())
    }

    /// Resolves an OID to its table for the open transaction.
    ///
    /// Returns `None` when the OID is unknown or the record replays data the
    /// table already flushed. On the first DML of the transaction the
    /// table's buffer is opened.
    async fn check_and_get_table(&mut self, oid: Oid) -> ChetlResult<Option<SharedTable<W>>> {
        let guard = self.tx_mut()?;
        let final_lsn = guard.final_lsn;

        let Some(name) = guard.oid_map.get(&oid).cloned() else {
            return Ok(None);
        };
        let Some(shared_table) = self.shared.tables.get(&name).cloned() else {
            return Ok(None);
        };

        let mut table = shared_table.lock().await;
        if final_lsn <= table.last_flushed_lsn {
            debug!(
                table = %name,
                tx_lsn = final_lsn.decimal(),
                table_lsn = table.last_flushed_lsn.decimal(),
                "tx lsn <= table lsn, replay dropped"
            );
            return Ok(None);
        }

        let guard = self.tx_mut()?;
        guard.tables_to_flush.insert(name.clone());
        if guard.in_tx_tables.insert(name.clone()) {
            debug!(table = %name, "table was added to the transaction");
            table.buffer.begin(final_lsn);
        }
        drop(table);

        Ok(Some(shared_table))
    }

    fn tx_mut(&mut self) -> ChetlResult<&mut OwnedMutexGuard<TxState>> {
        self.tx_guard.as_mut().ok_or_else(|| {
            chetl_error!(
                ErrorKind::InvalidState,
                "No transaction is open"
            )
        })
    }

    fn shared_table(&self, name: &TableName) -> ChetlResult<SharedTable<W>> {
        self.shared.tables.get(name).cloned().ok_or_else(|| {
            chetl_error!(
                ErrorKind::InvalidState,
                "Transaction references an unknown table",
                name.clone()
            )
        })
    }

    /// Resets the transaction state and releases the mutex after a fatal
    /// error so the flusher is not blocked forever.
    fn abort_transaction(&mut self) {
        if let Some(mut guard) = self.tx_guard.take() {
            guard.final_lsn = Lsn::INVALID;
            guard.is_empty_tx = true;
            guard.in_tx_tables.clear();
        }
    }

    fn log_throughput(&mut self) {
        counter!(CHETL_RECORDS_PROCESSED_TOTAL).increment(1);

        let elapsed = self.rate_window_started.elapsed();
        if elapsed.as_secs() >= THROUGHPUT_LOG_INTERVAL_SECS {
            if self.processed_records > 0 {
                let final_lsn = self
                    .tx_guard
                    .as_ref()
                    .map_or(Lsn::INVALID, |guard| guard.final_lsn);
                info!(
                    rate = format!("{:.2}", self.processed_records as f64 / elapsed.as_secs_f64()),
                    final_lsn = final_lsn.decimal(),
                    "stream processing rate msg/sec"
                );
            }

            self.rate_window_started = Instant::now();
            self.processed_records = 0;
        } else {
            self.processed_records += 1;
        }
    }
}

/// Replaces unchanged placeholders in an update's old row with the
/// corresponding values of the new row.
fn mask_unchanged(old_row: Row, new_row: &Row) -> Row {
    old_row
        .into_iter()
        .enumerate()
        .map(|(index, tuple)| match tuple.kind {
            TupleKind::Unchanged => new_row
                .get(index)
                .cloned()
                .unwrap_or(tuple),
            _ => tuple,
        })
        .collect()
}
