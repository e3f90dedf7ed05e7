use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chetl_postgres::types::Lsn;
use tracing::debug;

use crate::chetl_error;
use crate::error::{ChetlResult, ErrorKind};
use crate::state::store::StateStore;

/// Suffix of in-flight write files; never listed as keys.
const TMP_SUFFIX: &str = ".tmp";

/// File-per-key checkpoint store under a base directory.
///
/// Each write goes to a temporary file in the same directory, is fsynced and
/// then atomically renamed over the final file, so readers observe either
/// the previous or the new value.
#[derive(Debug)]
pub struct DiskvStore {
    base: PathBuf,
}

impl DiskvStore {
    /// Opens the store, creating the base directory when missing.
    pub fn open(base: &Path) -> ChetlResult<DiskvStore> {
        fs::create_dir_all(base).map_err(|e| {
            chetl_error!(
                ErrorKind::StateStoreWriteFailed,
                "Could not create the state store directory",
                base.display()
            )
            .with_source(e)
        })?;

        debug!(path = %base.display(), "opened diskv state store");

        Ok(DiskvStore {
            base: base.to_path_buf(),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    fn read_value(&self, key: &str) -> ChetlResult<String> {
        fs::read_to_string(self.key_path(key)).map_err(|e| {
            chetl_error!(
                ErrorKind::StateStoreReadFailed,
                "Could not read the stored value",
                key
            )
            .with_source(e)
        })
    }

    fn write_value(&self, key: &str, value: &str) -> ChetlResult<()> {
        let final_path = self.key_path(key);
        let tmp_path = self.base.join(format!("{key}{TMP_SUFFIX}"));

        let result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &final_path)
        })();

        result.map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            chetl_error!(
                ErrorKind::StateStoreWriteFailed,
                "Could not durably write the value",
                key
            )
            .with_source(e)
        })
    }
}

impl StateStore for DiskvStore {
    fn has(&self, key: &str) -> bool {
        self.key_path(key).is_file()
    }

    fn read_lsn(&self, key: &str) -> ChetlResult<Lsn> {
        let value = self.read_value(key)?;
        value.trim().parse::<Lsn>().map_err(|e| {
            chetl_error!(
                ErrorKind::StateCorrupted,
                "Corrupted LSN in storage",
                format!("key {key}, value {value:?}")
            )
            .with_source(e)
        })
    }

    fn write_lsn(&self, key: &str, lsn: Lsn) -> ChetlResult<()> {
        self.write_value(key, &lsn.to_string())
    }

    fn read_u64(&self, key: &str) -> ChetlResult<u64> {
        let value = self.read_value(key)?;
        value.trim().parse::<u64>().map_err(|e| {
            chetl_error!(
                ErrorKind::StateCorrupted,
                "Corrupted counter in storage",
                format!("key {key}, value {value:?}")
            )
            .with_source(e)
        })
    }

    fn write_u64(&self, key: &str, value: u64) -> ChetlResult<()> {
        self.write_value(key, &value.to_string())
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.ends_with(TMP_SUFFIX))
            .collect()
    }

    fn erase(&self, key: &str) -> ChetlResult<()> {
        fs::remove_file(self.key_path(key)).map_err(|e| {
            chetl_error!(
                ErrorKind::StateStoreWriteFailed,
                "Could not erase the stored value",
                key
            )
            .with_source(e)
        })
    }

    fn close(&self) -> ChetlResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskvStore::open(dir.path()).unwrap();

        assert!(!store.has("public.users"));
        store
            .write_lsn("public.users", Lsn::new(0x16_0000_0a00))
            .unwrap();
        assert!(store.has("public.users"));
        assert_eq!(
            store.read_lsn("public.users").unwrap(),
            Lsn::new(0x16_0000_0a00)
        );

        // The stored form is the canonical textual LSN.
        let raw = fs::read_to_string(dir.path().join("public.users")).unwrap();
        assert_eq!(raw, Lsn::new(0x16_0000_0a00).to_string());
    }

    #[test]
    fn test_u64_round_trip_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskvStore::open(dir.path()).unwrap();

        store.write_u64("public.users.row_id", 42).unwrap();
        store.write_lsn("public.orders", Lsn::new(7)).unwrap();

        assert_eq!(store.read_u64("public.users.row_id").unwrap(), 42);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["public.orders", "public.users.row_id"]);

        store.erase("public.orders").unwrap();
        assert!(!store.has("public.orders"));
    }

    #[test]
    fn test_corrupt_value_is_surfaced_and_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskvStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("public.users"), "not-an-lsn").unwrap();

        let error = store.read_lsn("public.users").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::StateCorrupted);

        // The corrupt value must not be overwritten by the failed read.
        let raw = fs::read_to_string(dir.path().join("public.users")).unwrap();
        assert_eq!(raw, "not-an-lsn");
    }

    #[test]
    fn test_missing_key_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskvStore::open(dir.path()).unwrap();

        let error = store.read_lsn("public.ghost").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::StateStoreReadFailed);
    }
}
