use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chetl_postgres::types::Lsn;
use memmap2::Mmap;
use tracing::debug;

use crate::chetl_error;
use crate::error::{ChetlError, ChetlResult, ErrorKind};
use crate::state::store::StateStore;

/// Single-file checkpoint store backed by a memory mapping.
///
/// The file holds one JSON object mapping keys to canonical textual values.
/// On open the file is memory-mapped and decoded; every write rewrites the
/// file atomically (temp file, fsync, rename) and refreshes the mapping, so
/// a crash leaves the previous snapshot intact.
#[derive(Debug)]
pub struct MmapStore {
    path: PathBuf,
    inner: Mutex<MmapInner>,
}

#[derive(Debug)]
struct MmapInner {
    entries: BTreeMap<String, String>,
    /// Read mapping of the current on-disk snapshot. Kept so readers of the
    /// raw file observe the same bytes the store decoded.
    map: Option<Mmap>,
}

impl MmapStore {
    /// Opens the store, creating an empty file when missing.
    pub fn open(path: &Path) -> ChetlResult<MmapStore> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| open_error(path).with_source(e))?;
        }

        let mut inner = MmapInner {
            entries: BTreeMap::new(),
            map: None,
        };

        if path.is_file() {
            let file = fs::File::open(path).map_err(|e| open_error(path).with_source(e))?;
            let len = file
                .metadata()
                .map_err(|e| open_error(path).with_source(e))?
                .len();

            if len > 0 {
                // Safety: the store owns the file and rewrites it only via
                // rename, so the mapping is never mutated in place.
                let map =
                    unsafe { Mmap::map(&file) }.map_err(|e| open_error(path).with_source(e))?;
                inner.entries = serde_json::from_slice(&map[..]).map_err(|e| {
                    chetl_error!(
                        ErrorKind::StateCorrupted,
                        "Corrupted state store file",
                        path.display()
                    )
                    .with_source(e)
                })?;
                inner.map = Some(map);
            }
        }

        debug!(path = %path.display(), entries = inner.entries.len(), "opened mmap state store");

        Ok(MmapStore {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MmapInner) -> ChetlResult<T>) -> ChetlResult<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| chetl_error!(ErrorKind::StateStoreWriteFailed, "State store poisoned"))?;
        f(&mut inner)
    }

    fn persist(&self, inner: &mut MmapInner) -> ChetlResult<()> {
        let tmp_path = self.path.with_extension("tmp");

        let result = (|| {
            let encoded = serde_json::to_vec(&inner.entries)?;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)?;

            let file = fs::File::open(&self.path)?;
            // Safety: see `open`.
            let map = unsafe { Mmap::map(&file) }?;
            inner.map = Some(map);
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        })();

        result.map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            chetl_error!(
                ErrorKind::StateStoreWriteFailed,
                "Could not durably write the state store file",
                self.path.display()
            )
            .with_source(e)
        })
    }

    fn read_value(&self, key: &str) -> ChetlResult<String> {
        self.with_inner(|inner| {
            inner.entries.get(key).cloned().ok_or_else(|| {
                chetl_error!(
                    ErrorKind::StateStoreReadFailed,
                    "Could not read the stored value",
                    key
                )
            })
        })
    }

    fn write_value(&self, key: &str, value: String) -> ChetlResult<()> {
        self.with_inner(|inner| {
            let previous = inner.entries.insert(key.to_string(), value);
            let result = self.persist(inner);
            if result.is_err() {
                // Keep the in-memory view consistent with the file.
                match previous {
                    Some(previous) => inner.entries.insert(key.to_string(), previous),
                    None => inner.entries.remove(key),
                };
            }
            result
        })
    }
}

fn open_error(path: &Path) -> ChetlError {
    chetl_error!(
        ErrorKind::StateStoreReadFailed,
        "Could not open the state store file",
        path.display()
    )
}

impl StateStore for MmapStore {
    fn has(&self, key: &str) -> bool {
        self.with_inner(|inner| Ok(inner.entries.contains_key(key)))
            .unwrap_or(false)
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
        self.write_value(key, lsn.to_string())
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
        self.write_value(key, value.to_string())
    }

    fn keys(&self) -> Vec<String> {
        self.with_inner(|inner| Ok(inner.entries.keys().cloned().collect()))
            .unwrap_or_default()
    }

    fn erase(&self, key: &str) -> ChetlResult<()> {
        self.with_inner(|inner| {
            let previous = inner.entries.remove(key);
            let result = self.persist(inner);
            if result.is_err()
                && let Some(previous) = previous
            {
                inner.entries.insert(key.to_string(), previous);
            }
            result
        })
    }

    fn close(&self) -> ChetlResult<()> {
        self.with_inner(|inner| {
            inner.map = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.chetl");

        {
            let store = MmapStore::open(&path).unwrap();
            store.write_lsn("public.users", Lsn::new(1234)).unwrap();
            store.write_u64("public.users.row_id", 99).unwrap();
        }

        let store = MmapStore::open(&path).unwrap();
        assert!(store.has("public.users"));
        assert_eq!(store.read_lsn("public.users").unwrap(), Lsn::new(1234));
        assert_eq!(store.read_u64("public.users.row_id").unwrap(), 99);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["public.users", "public.users.row_id"]);
    }

    #[test]
    fn test_corrupt_file_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.chetl");
        fs::write(&path, b"{ this is not json").unwrap();

        let error = MmapStore::open(&path).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::StateCorrupted);

        // The corrupt file is left untouched for inspection.
        assert_eq!(fs::read(&path).unwrap(), b"{ this is not json");
    }

    #[test]
    fn test_erase_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.chetl");

        let store = MmapStore::open(&path).unwrap();
        store.write_lsn("public.users", Lsn::new(1)).unwrap();
        store.erase("public.users").unwrap();
        drop(store);

        let store = MmapStore::open(&path).unwrap();
        assert!(!store.has("public.users"));
    }
}
