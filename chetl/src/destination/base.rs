use std::future::Future;

use bytes::Bytes;

use crate::error::ChetlResult;

/// Content encoding of an upload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    /// Uncompressed tab-separated rows.
    Plain,
    /// Gzip-compressed tab-separated rows.
    Gzip,
}

/// One complete bulk-load body.
///
/// Rows are tab-separated converted column bytes, one row per newline, with
/// the pipeline's trailing columns (`sign`, `row_id`, `lsn`, `table_name`)
/// already appended.
#[derive(Debug, Clone)]
pub struct UploadBody {
    pub encoding: ContentEncoding,
    pub bytes: Bytes,
}

/// Transport to the analytical warehouse.
///
/// The concrete client (HTTP or TCP transport, SQL dialect) is a
/// collaborator outside the pipeline core. Implementations must be cheap to
/// clone; the pipeline hands clones to the snapshot workers.
pub trait Warehouse: Clone + Send + Sync + 'static {
    /// Returns the name of the warehouse implementation.
    fn name() -> &'static str;

    /// Bulk-loads one body into the target table.
    fn bulk_upload(
        &self,
        target_table: &str,
        body: UploadBody,
    ) -> impl Future<Output = ChetlResult<()>> + Send;

    /// Executes a target-side statement, e.g. `TRUNCATE TABLE`.
    fn execute(&self, sql: &str) -> impl Future<Output = ChetlResult<()>> + Send;
}
