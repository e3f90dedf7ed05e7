//! Inactivity flusher.
//!
//! A periodic task that drains the per-table buffers between transactions.
//! Each pass takes the engine's transaction mutex for its whole duration, so
//! it can never observe an open transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::concurrency::errors::ErrorTx;
use crate::concurrency::shutdown::ShutdownRx;
use crate::destination::Warehouse;
use crate::error::ChetlResult;
use crate::replication::apply::EngineShared;
use crate::replication::state::LifecycleState;

/// The inactivity flusher task.
pub(crate) struct InactivityFlusher<W: Warehouse> {
    shared: Arc<EngineShared<W>>,
    err_tx: ErrorTx,
    period: Duration,
    shutdown_rx: ShutdownRx,
}

impl<W: Warehouse> InactivityFlusher<W> {
    pub(crate) fn new(
        shared: Arc<EngineShared<W>>,
        err_tx: ErrorTx,
        period: Duration,
        shutdown_rx: ShutdownRx,
    ) -> InactivityFlusher<W> {
        InactivityFlusher {
            shared,
            err_tx,
            period,
            shutdown_rx,
        }
    }

    /// Spawns the flusher loop.
    pub(crate) fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.signaled() => {
                    debug!("inactivity flusher stopping");
                    return;
                }

                _ = ticker.tick() => {}
            }

            if self.shared.lifecycle.load() != LifecycleState::Working {
                continue;
            }

            if let Err(error) = self.flush_pass().await {
                warn!(%error, "inactivity buffer flush failed");
                self.err_tx.send(error);
            }
        }
    }

    /// Flushes every pending table under the transaction mutex.
    pub(crate) async fn flush_pass(&self) -> ChetlResult<()> {
        let mut guard = self.shared.tx.lock().await;

        // Holding the mutex means no transaction is open.
        debug_assert!(!guard.final_lsn.is_valid());

        if guard.tables_to_flush.is_empty() {
            return Ok(());
        }

        debug!(tables = guard.tables_to_flush.len(), "inactivity buffer flush started");

        let lsn = guard.last_final_lsn;
        let pending: Vec<_> = guard.tables_to_flush.iter().cloned().collect();
        for name in pending {
            if self.shutdown_rx.is_shutdown() {
                return Ok(());
            }

            let Some(shared_table) = self.shared.tables.get(&name).cloned() else {
                continue;
            };
            let mut table = shared_table.lock().await;

            table.buffer.flush().await?;
            self.shared.store.write_lsn(&name.key_name(), lsn)?;
            table.last_flushed_lsn = lsn;
            guard.tables_to_flush.remove(&name);
        }

        if lsn.is_valid() {
            self.shared.consumer.advance_lsn(lsn);
        }

        debug!("inactivity buffer flush finished");

        Ok(())
    }
}
