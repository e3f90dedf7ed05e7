use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shared::{StorageConfig, TableConfig, ValidationError};

/// Compression level applied to outbound bulk-load streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GzipComprLevel {
    /// No compression.
    #[default]
    None,
    /// Favor speed over ratio.
    Fast,
    /// Balanced default.
    Default,
    /// Favor ratio over speed.
    Best,
}

impl GzipComprLevel {
    /// Returns `true` if the upload body should be gzip-compressed.
    pub fn use_compression(&self) -> bool {
        !matches!(self, GzipComprLevel::None)
    }
}

/// Configuration of the replication pipeline core.
///
/// Field names follow the options recognized by the replicator; durations are
/// plain integer fields with a unit suffix in the name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicatorConfig {
    /// Number of parallel snapshot workers.
    #[serde(default = "default_sync_workers")]
    pub sync_workers: usize,
    /// Retries when opening a temporary replication slot.
    #[serde(default = "default_create_slot_max_attempts")]
    pub create_slot_max_attempts: u32,
    /// Period of the inactivity flusher, in milliseconds.
    #[serde(default = "default_inactivity_flush_timeout_ms")]
    pub inactivity_flush_timeout_ms: u64,
    /// Capacity of the snapshot upload chunk, in bytes.
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,
    /// Internal buffer of the gzip encoder, in bytes.
    #[serde(default = "default_gzip_buf_size")]
    pub gzip_buf_size: usize,
    /// Compression applied to outbound bulk-load bodies.
    #[serde(default)]
    pub gzip_compression: GzipComprLevel,
    /// Seconds to pause between tables in a snapshot worker; zero disables
    /// the pause.
    #[serde(default)]
    pub sync_sleep_secs: u64,
    /// Durable checkpoint storage.
    pub storage: StorageConfig,
    /// Replicated tables keyed by `schema.name`.
    pub tables: BTreeMap<String, TableConfig>,
}

impl ReplicatorConfig {
    /// Default number of parallel snapshot workers.
    pub const DEFAULT_SYNC_WORKERS: usize = 4;

    /// Default number of temporary slot creation attempts.
    pub const DEFAULT_CREATE_SLOT_MAX_ATTEMPTS: u32 = 100;

    /// Default inactivity flush period in milliseconds.
    pub const DEFAULT_INACTIVITY_FLUSH_TIMEOUT_MS: u64 = 1_000;

    /// Default snapshot upload chunk capacity in bytes.
    pub const DEFAULT_PIPE_BUFFER_SIZE: usize = 10 * 1024 * 1024;

    /// Default gzip encoder buffer in bytes.
    pub const DEFAULT_GZIP_BUF_SIZE: usize = 64 * 1024;

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sync_workers == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync_workers".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.create_slot_max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "create_slot_max_attempts".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.inactivity_flush_timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "inactivity_flush_timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.pipe_buffer_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipe_buffer_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        for (name, table) in &self.tables {
            if table.max_buffer_size == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("tables.{name}.max_buffer_size"),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn default_sync_workers() -> usize {
    ReplicatorConfig::DEFAULT_SYNC_WORKERS
}

fn default_create_slot_max_attempts() -> u32 {
    ReplicatorConfig::DEFAULT_CREATE_SLOT_MAX_ATTEMPTS
}

fn default_inactivity_flush_timeout_ms() -> u64 {
    ReplicatorConfig::DEFAULT_INACTIVITY_FLUSH_TIMEOUT_MS
}

fn default_pipe_buffer_size() -> usize {
    ReplicatorConfig::DEFAULT_PIPE_BUFFER_SIZE
}

fn default_gzip_buf_size() -> usize {
    ReplicatorConfig::DEFAULT_GZIP_BUF_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{PersStorageType, TableEngineKind};

    fn minimal_config() -> ReplicatorConfig {
        serde_json::from_str(
            r#"{
                "storage": {"pers_storage_path": "/var/lib/chetl"},
                "tables": {
                    "public.users": {"engine": "CollapsingMergeTree"}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = minimal_config();

        assert_eq!(config.sync_workers, ReplicatorConfig::DEFAULT_SYNC_WORKERS);
        assert_eq!(
            config.create_slot_max_attempts,
            ReplicatorConfig::DEFAULT_CREATE_SLOT_MAX_ATTEMPTS
        );
        assert_eq!(config.gzip_compression, GzipComprLevel::None);
        assert_eq!(config.storage.pers_storage_type, PersStorageType::Diskv);
        assert_eq!(
            config.tables["public.users"].engine,
            TableEngineKind::CollapsingMergeTree
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = minimal_config();
        config.sync_workers = 0;

        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue {
                field: "sync_workers".to_string(),
                constraint: "must be greater than 0".to_string(),
            })
        );
    }

    #[test]
    fn test_gzip_level_use_compression() {
        assert!(!GzipComprLevel::None.use_compression());
        assert!(GzipComprLevel::Fast.use_compression());
        assert!(GzipComprLevel::Best.use_compression());
    }
}
