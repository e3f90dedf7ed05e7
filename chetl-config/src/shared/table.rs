use serde::{Deserialize, Serialize};

/// Target-side table engine flavor for a replicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TableEngineKind {
    /// Append-only engine: inserts only, updates and deletes are dropped.
    MergeTree,
    /// Collapsing engine: every logical row carries a `sign` column and the
    /// target materializes the latest row per key by summing signs.
    CollapsingMergeTree,
}

/// How a source-side `TRUNCATE` is applied to the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TruncateMode {
    /// Issue a target-side `TRUNCATE TABLE` on the next flush.
    #[default]
    TargetSide,
    /// Cancel the rows still buffered by dropping them; already-flushed rows
    /// are left to the collapsing engine.
    Tombstones,
}

/// Per-table replication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// Target-side engine flavor.
    pub engine: TableEngineKind,
    /// Source columns to replicate, in target column order. Empty means all
    /// columns of the relation.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Name of the target table. Defaults to the source relation name.
    #[serde(default)]
    pub target_table: Option<String>,
    /// Name of the `sign` column appended by collapsing engines.
    #[serde(default = "default_sign_column")]
    pub sign_column: String,
    /// Optional auxiliary column carrying a per-table monotonically
    /// increasing row id for secondary ordering.
    #[serde(default)]
    pub row_id_column: Option<String>,
    /// Skip this table during the initial snapshot phase.
    #[serde(default)]
    pub init_sync_skip: bool,
    /// Number of buffered rows after which a transaction commit flushes
    /// eagerly instead of waiting for the inactivity flusher.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// How a source `TRUNCATE` is applied.
    #[serde(default)]
    pub truncate_mode: TruncateMode,
}

impl TableConfig {
    /// Default number of buffered rows that triggers an eager flush.
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10_000;

    /// Creates a table configuration with defaults for the given engine.
    pub fn for_engine(engine: TableEngineKind) -> TableConfig {
        TableConfig {
            engine,
            columns: Vec::new(),
            target_table: None,
            sign_column: default_sign_column(),
            row_id_column: None,
            init_sync_skip: false,
            max_buffer_size: default_max_buffer_size(),
            truncate_mode: TruncateMode::default(),
        }
    }
}

fn default_sign_column() -> String {
    "sign".to_string()
}

fn default_max_buffer_size() -> usize {
    TableConfig::DEFAULT_MAX_BUFFER_SIZE
}
