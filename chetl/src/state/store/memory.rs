use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chetl_postgres::types::Lsn;

use crate::chetl_error;
use crate::error::{ChetlResult, ErrorKind};
use crate::state::store::StateStore;

/// In-memory checkpoint store for tests and development.
///
/// Values are stored in their canonical textual form so parsing behaves
/// exactly like the durable backends, including corruption surfacing when a
/// value is seeded with garbage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStateStore {
    pub fn new() -> MemoryStateStore {
        MemoryStateStore::default()
    }

    /// Seeds a raw textual value, bypassing validation. Used by tests to
    /// simulate corruption.
    pub fn seed_raw(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .insert(key.to_string(), value.to_string());
    }

    /// Returns the raw textual value stored under `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .get(key)
            .cloned()
    }

    fn read_value(&self, key: &str) -> ChetlResult<String> {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| {
                chetl_error!(
                    ErrorKind::StateStoreReadFailed,
                    "Could not read the stored value",
                    key
                )
            })
    }

    fn write_value(&self, key: &str, value: String) {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .insert(key.to_string(), value);
    }
}

impl StateStore for MemoryStateStore {
    fn has(&self, key: &str) -> bool {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .contains_key(key)
    }

    fn read_lsn(&self, key: &str) -> ChetlResult<Lsn> {
        let value = self.read_value(key)?;
        value.parse::<Lsn>().map_err(|e| {
            chetl_error!(
                ErrorKind::StateCorrupted,
                "Corrupted LSN in storage",
                format!("key {key}, value {value:?}")
            )
            .with_source(e)
        })
    }

    fn write_lsn(&self, key: &str, lsn: Lsn) -> ChetlResult<()> {
        self.write_value(key, lsn.to_string());
        Ok(())
    }

    fn read_u64(&self, key: &str) -> ChetlResult<u64> {
        let value = self.read_value(key)?;
        value.parse::<u64>().map_err(|e| {
            chetl_error!(
                ErrorKind::StateCorrupted,
                "Corrupted counter in storage",
                format!("key {key}, value {value:?}")
            )
            .with_source(e)
        })
    }

    fn write_u64(&self, key: &str, value: u64) -> ChetlResult<()> {
        self.write_value(key, value.to_string());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn erase(&self, key: &str) -> ChetlResult<()> {
        self.entries
            .lock()
            .expect("state store lock poisoned")
            .remove(key);
        Ok(())
    }

    fn close(&self) -> ChetlResult<()> {
        Ok(())
    }
}
