use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend used for the durable checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersStorageType {
    /// One file per key under a base directory.
    #[default]
    Diskv,
    /// A single memory-mapped file.
    Mmap,
}

/// Durable state storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend used to persist checkpoint state.
    #[serde(default)]
    pub pers_storage_type: PersStorageType,
    /// Base directory (diskv) or file path (mmap) of the store.
    pub pers_storage_path: PathBuf,
}
