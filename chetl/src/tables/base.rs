use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chetl_config::shared::{GzipComprLevel, ReplicatorConfig, TableConfig, TableEngineKind};
use chetl_postgres::types::{ColumnSchema, Lsn, RelationSchema, Row, TableName};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::chetl_error;
use crate::conversions::ColumnConverter;
use crate::conversions::copy::decode_copy_line;
use crate::destination::{Warehouse, compress_body};
use crate::error::{ChetlResult, ErrorKind};
use crate::metrics::{
    CHETL_FLUSH_DURATION_SECONDS, CHETL_ROWS_FLUSHED_TOTAL, CHETL_SNAPSHOT_ROWS_TOTAL,
    SOURCE_LABEL, TABLE_LABEL,
};
use crate::replication::source::SnapshotStream;
use crate::state::store::StateStore;
use crate::tables::{AppendTable, CollapsingTable};

/// Interval between initial-sync progress log lines.
const SYNC_PROGRESS_INTERVAL_SECS: u64 = 10;

/// Upload tuning shared by every table buffer.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Compression applied to outbound bodies.
    pub compression: GzipComprLevel,
    /// Internal buffer of the gzip encoder, in bytes.
    pub gzip_buf_size: usize,
    /// Capacity of the snapshot upload chunk, in bytes.
    pub pipe_buffer_size: usize,
}

impl UploadOptions {
    /// Extracts the upload tuning from the replicator configuration.
    pub fn from_config(config: &ReplicatorConfig) -> UploadOptions {
        UploadOptions {
            compression: config.gzip_compression,
            gzip_buf_size: config.gzip_buf_size,
            pipe_buffer_size: config.pipe_buffer_size,
        }
    }
}

/// One buffered row, encoded user columns plus the trailing column values
/// materialized at flush time.
#[derive(Debug, Clone)]
pub(crate) struct BufRow {
    /// Converted user columns, tab-separated.
    pub cols: Vec<u8>,
    /// Sign column value; `None` for append engines.
    pub sign: Option<i8>,
    /// Auxiliary row id, when configured.
    pub row_id: Option<u64>,
    /// Commit LSN of the transaction that produced the row.
    pub lsn: Lsn,
}

/// Shared core of the table buffer engines.
///
/// Rows arrive already ordered (source order within a transaction, commit
/// order across transactions) and are kept in that order: `tx_rows` holds
/// the open transaction, `rows` everything committed but not yet flushed.
pub(crate) struct GenericTable<W: Warehouse> {
    name: TableName,
    target_table: String,
    config: TableConfig,
    upload: UploadOptions,
    warehouse: W,
    store: Arc<dyn StateStore>,
    converter: Arc<dyn ColumnConverter>,
    relation: Option<Arc<RelationSchema>>,
    column_indexes: Vec<usize>,
    tx_rows: Vec<BufRow>,
    rows: Vec<BufRow>,
    tx_lsn: Lsn,
    next_row_id: Option<u64>,
    pending_truncate: bool,
}

impl<W: Warehouse> GenericTable<W> {
    pub(crate) fn new(
        name: TableName,
        config: TableConfig,
        warehouse: W,
        store: Arc<dyn StateStore>,
        converter: Arc<dyn ColumnConverter>,
        upload: UploadOptions,
    ) -> ChetlResult<GenericTable<W>> {
        let target_table = config
            .target_table
            .clone()
            .unwrap_or_else(|| name.name.clone());

        let next_row_id = match config.row_id_column {
            Some(_) => {
                let key = row_id_key(&name);
                if store.has(&key) {
                    Some(store.read_u64(&key)?)
                } else {
                    Some(0)
                }
            }
            None => None,
        };

        Ok(GenericTable {
            name,
            target_table,
            config,
            upload,
            warehouse,
            store,
            converter,
            relation: None,
            column_indexes: Vec::new(),
            tx_rows: Vec::new(),
            rows: Vec::new(),
            tx_lsn: Lsn::INVALID,
            next_row_id,
            pending_truncate: false,
        })
    }

    pub(crate) fn name(&self) -> &TableName {
        &self.name
    }

    pub(crate) fn relation(&self) -> Option<&RelationSchema> {
        self.relation.as_deref()
    }

    /// Installs the relation descriptor and resolves the configured column
    /// selection against it.
    pub(crate) fn set_relation(&mut self, relation: RelationSchema) -> ChetlResult<()> {
        let column_indexes = if self.config.columns.is_empty() {
            (0..relation.columns.len()).collect()
        } else {
            let mut indexes = Vec::with_capacity(self.config.columns.len());
            for configured in &self.config.columns {
                let index = relation
                    .columns
                    .iter()
                    .position(|column| &column.name == configured)
                    .ok_or_else(|| {
                        chetl_error!(
                            ErrorKind::ConfigurationError,
                            "Configured column is missing from the relation",
                            format!("{}.{configured}", self.name)
                        )
                    })?;
                indexes.push(index);
            }
            indexes
        };

        self.column_indexes = column_indexes;
        self.relation = Some(Arc::new(relation));

        Ok(())
    }

    /// Opens the buffer for one source transaction.
    pub(crate) fn begin(&mut self, final_lsn: Lsn) {
        self.tx_lsn = final_lsn;
    }

    /// Encodes and buffers one row of the open transaction.
    pub(crate) fn write_row(&mut self, row: &Row, sign: Option<i8>) -> ChetlResult<()> {
        let relation = self.relation.clone().ok_or_else(|| {
            chetl_error!(
                ErrorKind::InvalidState,
                "Row arrived before the relation descriptor",
                self.name.clone()
            )
        })?;

        let mut cols = Vec::new();
        for (position, &index) in self.column_indexes.iter().enumerate() {
            let column = &relation.columns[index];
            let tuple = row.get(index).ok_or_else(|| {
                chetl_error!(
                    ErrorKind::InvalidState,
                    "Row is shorter than the relation descriptor",
                    format!("{}.{}", self.name, column.name)
                )
            })?;

            if position > 0 {
                cols.push(b'\t');
            }
            self.converter.convert(&mut cols, column, tuple)?;
        }

        let row_id = self.take_row_id();
        self.tx_rows.push(BufRow {
            cols,
            sign,
            row_id,
            lsn: self.tx_lsn,
        });

        Ok(())
    }

    fn take_row_id(&mut self) -> Option<u64> {
        let id = self.next_row_id;
        if let Some(id) = id {
            self.next_row_id = Some(id + 1);
        }
        id
    }

    fn encode_row_into(&self, out: &mut Vec<u8>, row: &BufRow) {
        out.extend_from_slice(&row.cols);
        if let Some(sign) = row.sign {
            out.push(b'\t');
            out.extend_from_slice(sign.to_string().as_bytes());
        }
        if let Some(row_id) = row.row_id {
            out.push(b'\t');
            out.extend_from_slice(row_id.to_string().as_bytes());
        }
        out.push(b'\t');
        out.extend_from_slice(row.lsn.decimal().to_string().as_bytes());
        out.push(b'\t');
        out.extend_from_slice(self.name.to_string().as_bytes());
        out.push(b'\n');
    }

    /// Folds the open transaction into the accumulated buffer, flushing
    /// eagerly once the configured row limit is reached.
    ///
    /// Returns `true` when a flush happened so the caller can record the
    /// commit LSN.
    pub(crate) async fn commit(&mut self) -> ChetlResult<bool> {
        self.rows.append(&mut self.tx_rows);

        if self.rows.len() >= self.config.max_buffer_size {
            debug!(table = %self.name, rows = self.rows.len(), "buffer limit reached, flushing on commit");
            self.flush().await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Pushes the accumulated rows to the warehouse.
    ///
    /// On error the rows stay buffered; durable positions only advance after
    /// the caller observes success.
    pub(crate) async fn flush(&mut self) -> ChetlResult<()> {
        if self.pending_truncate {
            self.warehouse
                .execute(&format!("TRUNCATE TABLE {}", self.target_table))
                .await?;
            self.pending_truncate = false;
        }

        if self.rows.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let row_count = self.rows.len();

        let mut body = Vec::new();
        for row in &self.rows {
            self.encode_row_into(&mut body, row);
        }

        let body = compress_body(body, self.upload.compression, self.upload.gzip_buf_size)?;
        self.warehouse.bulk_upload(&self.target_table, body).await?;
        self.rows.clear();

        if let Some(next_row_id) = self.next_row_id {
            self.store.write_u64(&row_id_key(&self.name), next_row_id)?;
        }

        counter!(
            CHETL_ROWS_FLUSHED_TOTAL,
            TABLE_LABEL => self.name.to_string(),
            SOURCE_LABEL => "streaming"
        )
        .increment(row_count as u64);
        histogram!(
            CHETL_FLUSH_DURATION_SECONDS,
            TABLE_LABEL => self.name.to_string()
        )
        .record(started.elapsed().as_secs_f64());

        info!(table = %self.name, rows = row_count, "flushed table buffer");

        Ok(())
    }

    /// Discards everything buffered and schedules a target-side `TRUNCATE`
    /// for the next flush.
    pub(crate) fn truncate_target_side(&mut self) {
        self.tx_rows.clear();
        self.rows.clear();
        self.pending_truncate = true;
    }

    /// Cancels every buffered signed row by appending a `sign = -1` copy.
    ///
    /// Rows already flushed are left to the collapsing engine on the target;
    /// only the buffer's view can be tombstoned from here.
    pub(crate) fn truncate_tombstones(&mut self) {
        let mut tombstones: Vec<BufRow> = self
            .rows
            .iter()
            .chain(self.tx_rows.iter())
            .filter(|row| row.sign.is_some())
            .map(|row| BufRow {
                cols: row.cols.clone(),
                sign: Some(-1),
                row_id: None,
                lsn: self.tx_lsn,
            })
            .collect();

        for tombstone in &mut tombstones {
            tombstone.row_id = self.take_row_id();
        }

        self.tx_rows.extend(tombstones);
    }

    /// Prepares the target table for an initial load.
    pub(crate) async fn init_sync(&mut self) -> ChetlResult<()> {
        self.tx_rows.clear();
        self.rows.clear();
        self.pending_truncate = false;

        self.warehouse
            .execute(&format!("TRUNCATE TABLE {}", self.target_table))
            .await?;

        info!(table = %self.name, target = %self.target_table, "prepared table for initial sync");

        Ok(())
    }

    /// Streams the source's copy output into the warehouse and records the
    /// snapshot LSN on completion.
    pub(crate) async fn sync<T: SnapshotStream>(
        &mut self,
        snapshot: &mut T,
        snapshot_lsn: Lsn,
        sign: Option<i8>,
    ) -> ChetlResult<()> {
        let column_map = self.sync_column_map(snapshot.column_schemas())?;

        let started = Instant::now();
        let mut last_progress = Instant::now();
        let mut rows_copied = 0u64;
        let mut bytes_read = 0u64;
        let mut chunk: Vec<u8> = Vec::with_capacity(self.upload.pipe_buffer_size);

        while let Some(line) = snapshot.next_line().await? {
            bytes_read += line.len() as u64;

            let mut cols = Vec::new();
            decode_copy_line(&line, &column_map, self.converter.as_ref(), &mut cols)?;

            let buf_row = BufRow {
                cols,
                sign,
                row_id: self.take_row_id(),
                lsn: snapshot_lsn,
            };
            self.encode_row_into(&mut chunk, &buf_row);
            rows_copied += 1;

            if chunk.len() >= self.upload.pipe_buffer_size {
                self.upload_sync_chunk(&mut chunk).await?;
            }

            if last_progress.elapsed().as_secs() >= SYNC_PROGRESS_INTERVAL_SECS {
                info!(
                    table = %self.name,
                    rows = rows_copied,
                    bytes = bytes_read,
                    "initial sync progress"
                );
                last_progress = Instant::now();
            }
        }

        if !chunk.is_empty() {
            self.upload_sync_chunk(&mut chunk).await?;
        }

        self.store
            .write_lsn(&self.name.key_name(), snapshot_lsn)?;
        if let Some(next_row_id) = self.next_row_id {
            self.store.write_u64(&row_id_key(&self.name), next_row_id)?;
        }

        counter!(
            CHETL_SNAPSHOT_ROWS_TOTAL,
            TABLE_LABEL => self.name.to_string()
        )
        .increment(rows_copied);

        info!(
            table = %self.name,
            rows = rows_copied,
            elapsed_secs = started.elapsed().as_secs(),
            snapshot_lsn = %snapshot_lsn,
            "initial sync finished"
        );

        Ok(())
    }

    fn sync_column_map(
        &self,
        columns: &[ColumnSchema],
    ) -> ChetlResult<HashMap<usize, ColumnSchema>> {
        if self.config.columns.is_empty() {
            return Ok(columns
                .iter()
                .enumerate()
                .map(|(index, column)| (index, column.clone()))
                .collect());
        }

        let mut map = HashMap::with_capacity(self.config.columns.len());
        for configured in &self.config.columns {
            let index = columns
                .iter()
                .position(|column| &column.name == configured)
                .ok_or_else(|| {
                    chetl_error!(
                        ErrorKind::ConfigurationError,
                        "Configured column is missing from the copy stream",
                        format!("{}.{configured}", self.name)
                    )
                })?;
            map.insert(index, columns[index].clone());
        }

        Ok(map)
    }

    async fn upload_sync_chunk(&self, chunk: &mut Vec<u8>) -> ChetlResult<()> {
        let body = compress_body(
            std::mem::take(chunk),
            self.upload.compression,
            self.upload.gzip_buf_size,
        )?;
        self.warehouse.bulk_upload(&self.target_table, body).await
    }

    pub(crate) fn buffered_rows(&self) -> usize {
        self.rows.len() + self.tx_rows.len()
    }

    pub(crate) fn truncate_mode(&self) -> chetl_config::shared::TruncateMode {
        self.config.truncate_mode
    }
}

fn row_id_key(name: &TableName) -> String {
    format!("{}.row_id", name.key_name())
}

/// Tagged per-table buffer over the two engine flavors.
pub enum TableBuffer<W: Warehouse> {
    Append(AppendTable<W>),
    Collapsing(CollapsingTable<W>),
}

impl<W: Warehouse> TableBuffer<W> {
    /// Creates the buffer flavor selected by the table configuration.
    pub fn new(
        name: TableName,
        config: TableConfig,
        warehouse: W,
        store: Arc<dyn StateStore>,
        converter: Arc<dyn ColumnConverter>,
        upload: UploadOptions,
    ) -> ChetlResult<TableBuffer<W>> {
        let engine = config.engine;
        let generic = GenericTable::new(name, config, warehouse, store, converter, upload)?;

        Ok(match engine {
            TableEngineKind::MergeTree => TableBuffer::Append(AppendTable::new(generic)),
            TableEngineKind::CollapsingMergeTree => {
                TableBuffer::Collapsing(CollapsingTable::new(generic))
            }
        })
    }

    fn generic(&self) -> &GenericTable<W> {
        match self {
            TableBuffer::Append(table) => table.generic(),
            TableBuffer::Collapsing(table) => table.generic(),
        }
    }

    fn generic_mut(&mut self) -> &mut GenericTable<W> {
        match self {
            TableBuffer::Append(table) => table.generic_mut(),
            TableBuffer::Collapsing(table) => table.generic_mut(),
        }
    }

    /// Returns the relation descriptor most recently installed.
    pub fn relation(&self) -> Option<&RelationSchema> {
        self.generic().relation()
    }

    /// Installs the relation descriptor delivered by the stream.
    pub fn set_relation(&mut self, relation: RelationSchema) -> ChetlResult<()> {
        self.generic_mut().set_relation(relation)
    }

    /// Opens the buffer for one source transaction.
    pub fn begin(&mut self, final_lsn: Lsn) {
        self.generic_mut().begin(final_lsn);
    }

    /// Buffers an insert.
    pub fn insert(&mut self, new_row: &Row) -> ChetlResult<()> {
        match self {
            TableBuffer::Append(table) => table.insert(new_row),
            TableBuffer::Collapsing(table) => table.insert(new_row),
        }
    }

    /// Buffers an update. `old_row` has unchanged tuples already masked out.
    pub fn update(&mut self, old_row: Option<&Row>, new_row: &Row) -> ChetlResult<()> {
        match self {
            TableBuffer::Append(table) => table.update(old_row, new_row),
            TableBuffer::Collapsing(table) => table.update(old_row, new_row),
        }
    }

    /// Buffers a delete.
    pub fn delete(&mut self, old_row: &Row) -> ChetlResult<()> {
        match self {
            TableBuffer::Append(table) => table.delete(old_row),
            TableBuffer::Collapsing(table) => table.delete(old_row),
        }
    }

    /// Applies a source-side truncate.
    pub fn truncate(&mut self) {
        match self {
            TableBuffer::Append(table) => table.truncate(),
            TableBuffer::Collapsing(table) => table.truncate(),
        }
    }

    /// Folds the open transaction into the buffer; returns `true` when the
    /// buffer flushed eagerly.
    pub async fn commit(&mut self) -> ChetlResult<bool> {
        self.generic_mut().commit().await
    }

    /// Pushes the accumulated rows to the warehouse.
    pub async fn flush(&mut self) -> ChetlResult<()> {
        self.generic_mut().flush().await
    }

    /// Prepares the target table for an initial load.
    pub async fn init_sync(&mut self) -> ChetlResult<()> {
        self.generic_mut().init_sync().await
    }

    /// Streams the initial copy and records the snapshot LSN.
    pub async fn sync<T: SnapshotStream>(
        &mut self,
        snapshot: &mut T,
        snapshot_lsn: Lsn,
    ) -> ChetlResult<()> {
        match self {
            TableBuffer::Append(table) => table.sync(snapshot, snapshot_lsn).await,
            TableBuffer::Collapsing(table) => table.sync(snapshot, snapshot_lsn).await,
        }
    }

    /// Number of rows currently buffered, including the open transaction.
    pub fn buffered_rows(&self) -> usize {
        self.generic().buffered_rows()
    }

    /// Number of updates dropped by an append engine; zero for collapsing.
    pub fn dropped_updates(&self) -> u64 {
        match self {
            TableBuffer::Append(table) => table.dropped_updates(),
            TableBuffer::Collapsing(_) => 0,
        }
    }

    /// Number of deletes dropped by an append engine; zero for collapsing.
    pub fn dropped_deletes(&self) -> u64 {
        match self {
            TableBuffer::Append(table) => table.dropped_deletes(),
            TableBuffer::Collapsing(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::TextConverter;
    use crate::destination::memory::MemoryWarehouse;
    use crate::state::store::MemoryStateStore;
    use chetl_config::shared::TruncateMode;
    use chetl_postgres::types::{ColumnSchema, ReplicaIdentity, Tuple};

    fn relation(oid: u32) -> RelationSchema {
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

    fn row(id: &str, name: &str) -> Row {
        vec![
            Tuple::text(id.as_bytes().to_vec()),
            Tuple::text(name.as_bytes().to_vec()),
        ]
    }

    fn make_buffer(
        config: TableConfig,
        warehouse: MemoryWarehouse,
        store: MemoryStateStore,
    ) -> TableBuffer<MemoryWarehouse> {
        let mut buffer = TableBuffer::new(
            TableName::new("public", "users"),
            config,
            warehouse,
            Arc::new(store),
            Arc::new(TextConverter),
            UploadOptions {
                compression: GzipComprLevel::None,
                gzip_buf_size: 64,
                pipe_buffer_size: 1024,
            },
        )
        .unwrap();
        buffer.set_relation(relation(16384)).unwrap();
        buffer
    }

    #[tokio::test]
    async fn test_collapsing_update_writes_signed_pair() {
        let warehouse = MemoryWarehouse::new();
        let mut buffer = make_buffer(
            TableConfig::for_engine(TableEngineKind::CollapsingMergeTree),
            warehouse.clone(),
            MemoryStateStore::new(),
        );

        buffer.begin(Lsn::new(100));
        buffer.insert(&row("1", "alice")).unwrap();
        buffer
            .update(Some(&row("1", "alice")), &row("1", "bob"))
            .unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        let rows = warehouse.rows("users");
        assert_eq!(
            rows,
            vec![
                "1\talice\t1\t100\tpublic.users",
                "1\talice\t-1\t100\tpublic.users",
                "1\tbob\t1\t100\tpublic.users",
            ]
        );
        // A key collapses to a single visible row.
        assert_eq!(warehouse.sum_field_from_end("users", 2), 1);
    }

    #[tokio::test]
    async fn test_collapsing_delete_writes_tombstone() {
        let warehouse = MemoryWarehouse::new();
        let mut buffer = make_buffer(
            TableConfig::for_engine(TableEngineKind::CollapsingMergeTree),
            warehouse.clone(),
            MemoryStateStore::new(),
        );

        buffer.begin(Lsn::new(7));
        buffer.insert(&row("1", "alice")).unwrap();
        buffer.delete(&row("1", "alice")).unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(warehouse.sum_field_from_end("users", 2), 0);
    }

    #[tokio::test]
    async fn test_append_drops_updates_and_deletes() {
        let warehouse = MemoryWarehouse::new();
        let mut buffer = make_buffer(
            TableConfig::for_engine(TableEngineKind::MergeTree),
            warehouse.clone(),
            MemoryStateStore::new(),
        );

        buffer.begin(Lsn::new(5));
        buffer.insert(&row("1", "alice")).unwrap();
        buffer
            .update(Some(&row("1", "alice")), &row("1", "bob"))
            .unwrap();
        buffer.delete(&row("1", "bob")).unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        // Inserts only, without a sign column.
        assert_eq!(warehouse.rows("users"), vec!["1\talice\t5\tpublic.users"]);
        assert_eq!(buffer.dropped_updates(), 1);
        assert_eq!(buffer.dropped_deletes(), 1);
    }

    #[tokio::test]
    async fn test_commit_flushes_eagerly_at_buffer_limit() {
        let warehouse = MemoryWarehouse::new();
        let mut config = TableConfig::for_engine(TableEngineKind::CollapsingMergeTree);
        config.max_buffer_size = 3;
        let mut buffer = make_buffer(config, warehouse.clone(), MemoryStateStore::new());

        buffer.begin(Lsn::new(1));
        buffer.insert(&row("1", "a")).unwrap();
        buffer.insert(&row("2", "b")).unwrap();
        assert!(!buffer.commit().await.unwrap());
        assert_eq!(warehouse.row_count("users"), 0);

        buffer.begin(Lsn::new(2));
        buffer.insert(&row("3", "c")).unwrap();
        assert!(buffer.commit().await.unwrap());
        assert_eq!(warehouse.row_count("users"), 3);
        assert_eq!(buffer.buffered_rows(), 0);
    }

    #[tokio::test]
    async fn test_row_id_counter_is_persistent() {
        let warehouse = MemoryWarehouse::new();
        let store = MemoryStateStore::new();
        let mut config = TableConfig::for_engine(TableEngineKind::CollapsingMergeTree);
        config.row_id_column = Some("row_id".to_string());

        let mut buffer = make_buffer(config.clone(), warehouse.clone(), store.clone());
        buffer.begin(Lsn::new(1));
        buffer.insert(&row("1", "a")).unwrap();
        buffer.insert(&row("2", "b")).unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(
            warehouse.rows("users"),
            vec![
                "1\ta\t1\t0\t1\tpublic.users",
                "2\tb\t1\t1\t1\tpublic.users",
            ]
        );
        assert_eq!(store.read_u64("public.users.row_id").unwrap(), 2);

        // A new buffer over the same store continues the sequence.
        let mut buffer = make_buffer(config, warehouse.clone(), store);
        buffer.begin(Lsn::new(2));
        buffer.insert(&row("3", "c")).unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        let rows = warehouse.rows("users");
        assert_eq!(rows.last().unwrap(), "3\tc\t1\t2\t2\tpublic.users");
    }

    #[tokio::test]
    async fn test_truncate_target_side() {
        let warehouse = MemoryWarehouse::new();
        let mut buffer = make_buffer(
            TableConfig::for_engine(TableEngineKind::CollapsingMergeTree),
            warehouse.clone(),
            MemoryStateStore::new(),
        );

        buffer.begin(Lsn::new(1));
        buffer.insert(&row("1", "a")).unwrap();
        buffer.truncate();
        buffer.insert(&row("2", "b")).unwrap();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        // The TRUNCATE runs before the rows written after it.
        assert_eq!(warehouse.statements(), vec!["TRUNCATE TABLE users"]);
        assert_eq!(warehouse.rows("users"), vec!["2\tb\t1\t1\tpublic.users"]);
    }

    #[tokio::test]
    async fn test_truncate_tombstones_cancel_buffered_rows() {
        let warehouse = MemoryWarehouse::new();
        let mut config = TableConfig::for_engine(TableEngineKind::CollapsingMergeTree);
        config.truncate_mode = TruncateMode::Tombstones;
        let mut buffer = make_buffer(config, warehouse.clone(), MemoryStateStore::new());

        buffer.begin(Lsn::new(1));
        for i in 0..4 {
            buffer.insert(&row(&i.to_string(), "x")).unwrap();
        }
        buffer.truncate();
        buffer.commit().await.unwrap();
        buffer.flush().await.unwrap();

        // Four inserts plus four tombstones, summing to zero.
        assert_eq!(warehouse.row_count("users"), 8);
        assert_eq!(warehouse.sum_field_from_end("users", 2), 0);
        assert!(warehouse.statements().is_empty());
    }

    #[tokio::test]
    async fn test_insert_before_relation_is_an_error() {
        let warehouse = MemoryWarehouse::new();
        let mut buffer = make_buffer(
            TableConfig::for_engine(TableEngineKind::CollapsingMergeTree),
            warehouse.clone(),
            MemoryStateStore::new(),
        );

        // A row that arrives before the relation descriptor is an error and
        // must not corrupt the buffer.
        let mut fresh = TableBuffer::new(
            TableName::new("public", "users"),
            TableConfig::for_engine(TableEngineKind::CollapsingMergeTree),
            warehouse.clone(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(TextConverter),
            UploadOptions {
                compression: GzipComprLevel::None,
                gzip_buf_size: 64,
                pipe_buffer_size: 1024,
            },
        )
        .unwrap();
        fresh.begin(Lsn::new(1));
        assert!(fresh.insert(&row("1", "a")).is_err());

        // Unrelated: flushing an empty buffer is a no-op.
        buffer.flush().await.unwrap();
        assert_eq!(warehouse.row_count("users"), 0);
    }
}
