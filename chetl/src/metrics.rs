//! Metric names and labels emitted by the pipeline.

use metrics::{describe_counter, describe_histogram};

/// Total number of replication records processed by the engine.
pub const CHETL_RECORDS_PROCESSED_TOTAL: &str = "chetl_records_processed_total";

/// Total number of rows pushed to the warehouse.
pub const CHETL_ROWS_FLUSHED_TOTAL: &str = "chetl_rows_flushed_total";

/// Duration of one buffer flush, in seconds.
pub const CHETL_FLUSH_DURATION_SECONDS: &str = "chetl_flush_duration_seconds";

/// Total number of rows copied during initial snapshots.
pub const CHETL_SNAPSHOT_ROWS_TOTAL: &str = "chetl_snapshot_rows_total";

/// Label carrying the source table name.
pub const TABLE_LABEL: &str = "table";

/// Label distinguishing streaming flushes from snapshot uploads.
pub const SOURCE_LABEL: &str = "source";

/// Registers descriptions for all pipeline metrics.
pub fn register_metrics() {
    describe_counter!(
        CHETL_RECORDS_PROCESSED_TOTAL,
        "Total number of replication records processed by the engine"
    );
    describe_counter!(
        CHETL_ROWS_FLUSHED_TOTAL,
        "Total number of rows pushed to the warehouse"
    );
    describe_histogram!(
        CHETL_FLUSH_DURATION_SECONDS,
        "Duration of one buffer flush in seconds"
    );
    describe_counter!(
        CHETL_SNAPSHOT_ROWS_TOTAL,
        "Total number of rows copied during initial snapshots"
    );
}
