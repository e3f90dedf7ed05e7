//! In-memory implementations of the collaborator contracts, for tests.

mod source;

pub use source::*;

use chetl_config::shared::{ReplicatorConfig, StorageConfig, TableConfig, TableEngineKind};
use chetl_postgres::types::{ColumnSchema, ReplicaIdentity, RelationSchema, Row, Tuple};
use chrono::{DateTime, Utc};

use crate::types::{
    BeginBody, CommitBody, DeleteBody, InsertBody, LogicalMessage, Lsn, Oid, TruncateBody,
    UpdateBody,
};

/// Builds a two-column `public.users (id, name)` relation descriptor.
pub fn users_relation(oid: Oid) -> RelationSchema {
    RelationSchema {
        oid,
        namespace: "public".to_string(),
        name: "users".to_string(),
        replica_identity: ReplicaIdentity::Full,
        columns: vec![
            ColumnSchema {
                is_key: true,
                name: "id".to_string(),
                type_oid: 20,
                modifier: -1,
            },
            ColumnSchema {
                is_key: false,
                name: "name".to_string(),
                type_oid: 25,
                modifier: -1,
            },
        ],
    }
}

/// Builds a `(id, name)` row for [`users_relation`].
pub fn user_row(id: u64, name: &str) -> Row {
    vec![
        Tuple::text(id.to_string().into_bytes()),
        Tuple::text(name.as_bytes().to_vec()),
    ]
}

/// Builds a replicator configuration over the given tables with fast test
/// timings.
pub fn test_config(tables: &[(&str, TableConfig)]) -> ReplicatorConfig {
    ReplicatorConfig {
        sync_workers: 2,
        create_slot_max_attempts: 3,
        inactivity_flush_timeout_ms: 25,
        pipe_buffer_size: 64 * 1024,
        gzip_buf_size: 16 * 1024,
        gzip_compression: Default::default(),
        sync_sleep_secs: 0,
        storage: StorageConfig {
            pers_storage_type: Default::default(),
            pers_storage_path: "/unused-in-tests".into(),
        },
        tables: tables
            .iter()
            .map(|(key, config)| (key.to_string(), config.clone()))
            .collect(),
    }
}

/// Default collapsing table configuration.
pub fn collapsing_table() -> TableConfig {
    TableConfig::for_engine(TableEngineKind::CollapsingMergeTree)
}

/// Default append table configuration.
pub fn append_table() -> TableConfig {
    TableConfig::for_engine(TableEngineKind::MergeTree)
}

fn test_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid test timestamp")
}

/// Builds a `Begin` record for a transaction committing at `final_lsn`.
pub fn begin(final_lsn: u64) -> LogicalMessage {
    LogicalMessage::Begin(BeginBody {
        final_lsn: Lsn::new(final_lsn),
        timestamp: test_timestamp(),
        xid: final_lsn as u32,
    })
}

/// Builds the matching `Commit` record for [`begin`].
pub fn commit(final_lsn: u64) -> LogicalMessage {
    LogicalMessage::Commit(CommitBody {
        flags: 0,
        lsn: Lsn::new(final_lsn),
        tx_lsn: Lsn::new(final_lsn + 8),
        timestamp: test_timestamp(),
    })
}

/// Builds an `Insert` record.
pub fn insert(oid: Oid, new_row: Row) -> LogicalMessage {
    LogicalMessage::Insert(InsertBody {
        relation_oid: oid,
        is_new: true,
        new_row,
    })
}

/// Builds an `Update` record carrying the full old row.
pub fn update(oid: Oid, old_row: Row, new_row: Row) -> LogicalMessage {
    LogicalMessage::Update(UpdateBody {
        relation_oid: oid,
        is_key: false,
        is_old: true,
        old_row: Some(old_row),
        new_row,
    })
}

/// Builds a `Delete` record carrying the full old row.
pub fn delete(oid: Oid, old_row: Row) -> LogicalMessage {
    LogicalMessage::Delete(DeleteBody {
        relation_oid: oid,
        is_key: false,
        is_old: true,
        old_row,
    })
}

/// Builds a `Truncate` record.
pub fn truncate(oids: Vec<Oid>) -> LogicalMessage {
    LogicalMessage::Truncate(TruncateBody {
        relation_oids: oids,
        cascade: false,
        restart_identity: false,
    })
}
