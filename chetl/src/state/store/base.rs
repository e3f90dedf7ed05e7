use std::sync::Arc;

use chetl_config::shared::{PersStorageType, StorageConfig};
use chetl_postgres::types::Lsn;

use crate::error::ChetlResult;
use crate::state::store::{DiskvStore, MmapStore};

/// Durable key-value store for replication checkpoints.
///
/// Values are canonical text: the `H/L` form for LSNs and plain decimal for
/// counters. Writes are atomic and durable by the time they return; a crash
/// at any other moment leaves the previous value intact. Reads surface
/// corruption as a typed error, never as a silent zero.
///
/// Implementations serialize their own internal state; callers must
/// serialize writes per key.
pub trait StateStore: Send + Sync {
    /// Returns `true` if a value is stored under `key`.
    fn has(&self, key: &str) -> bool;

    /// Reads the LSN stored under `key`.
    fn read_lsn(&self, key: &str) -> ChetlResult<Lsn>;

    /// Durably writes the LSN under `key`.
    fn write_lsn(&self, key: &str, lsn: Lsn) -> ChetlResult<()>;

    /// Reads the counter stored under `key`.
    fn read_u64(&self, key: &str) -> ChetlResult<u64>;

    /// Durably writes the counter under `key`.
    fn write_u64(&self, key: &str, value: u64) -> ChetlResult<()>;

    /// Returns every stored key.
    fn keys(&self) -> Vec<String>;

    /// Removes the value stored under `key`.
    fn erase(&self, key: &str) -> ChetlResult<()>;

    /// Releases the store.
    fn close(&self) -> ChetlResult<()>;
}

/// Opens the checkpoint store selected by the configuration.
pub fn open_store(config: &StorageConfig) -> ChetlResult<Arc<dyn StateStore>> {
    match config.pers_storage_type {
        PersStorageType::Diskv => Ok(Arc::new(DiskvStore::open(&config.pers_storage_path)?)),
        PersStorageType::Mmap => Ok(Arc::new(MmapStore::open(&config.pers_storage_path)?)),
    }
}
