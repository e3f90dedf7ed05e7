use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::chetl_error;
use crate::destination::{ContentEncoding, UploadBody, Warehouse};
use crate::error::{ChetlResult, ErrorKind};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<String>>,
    statements: Vec<String>,
}

/// In-memory warehouse for tests and development.
///
/// Captures every uploaded row (decompressed, one string per line) and every
/// executed statement so tests can assert on the exact outbound stream. A
/// `TRUNCATE TABLE` statement clears the captured rows of that table, which
/// mirrors what the real target would do.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> MemoryWarehouse {
        MemoryWarehouse::default()
    }

    /// Returns the captured rows of a table.
    pub fn rows(&self, target_table: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("memory warehouse lock poisoned")
            .tables
            .get(target_table)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of captured rows of a table.
    pub fn row_count(&self, target_table: &str) -> usize {
        self.rows(target_table).len()
    }

    /// Returns every executed statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("memory warehouse lock poisoned")
            .statements
            .clone()
    }

    /// Sums a numeric trailing column over all rows of a table.
    ///
    /// `index_from_end` is zero-based from the last tab-separated field, so
    /// with the standard trailing columns the `table_name` column is 0, the
    /// `lsn` column is 1 and the `sign` column of a collapsing table without
    /// a row id is 2.
    pub fn sum_field_from_end(&self, target_table: &str, index_from_end: usize) -> i64 {
        self.rows(target_table)
            .iter()
            .filter_map(|row| {
                let fields: Vec<&str> = row.split('\t').collect();
                fields
                    .len()
                    .checked_sub(1 + index_from_end)
                    .and_then(|i| fields[i].parse::<i64>().ok())
            })
            .sum()
    }
}

impl Warehouse for MemoryWarehouse {
    fn name() -> &'static str {
        "memory"
    }

    async fn bulk_upload(&self, target_table: &str, body: UploadBody) -> ChetlResult<()> {
        let raw = match body.encoding {
            ContentEncoding::Plain => body.bytes.to_vec(),
            ContentEncoding::Gzip => {
                let mut decoded = Vec::new();
                flate2::read::GzDecoder::new(&body.bytes[..])
                    .read_to_end(&mut decoded)
                    .map_err(|e| {
                        chetl_error!(
                            ErrorKind::DestinationError,
                            "Invalid gzip body",
                            target_table
                        )
                        .with_source(e)
                    })?;
                decoded
            }
        };

        let text = String::from_utf8(raw).map_err(|e| {
            chetl_error!(
                ErrorKind::DestinationError,
                "Upload body is not valid UTF-8",
                target_table
            )
            .with_source(e)
        })?;

        let mut inner = self.inner.lock().expect("memory warehouse lock poisoned");
        let rows = inner.tables.entry(target_table.to_string()).or_default();
        let mut added = 0usize;
        for line in text.lines() {
            rows.push(line.to_string());
            added += 1;
        }

        debug!(table = target_table, rows = added, "memory warehouse upload");

        Ok(())
    }

    async fn execute(&self, sql: &str) -> ChetlResult<()> {
        let mut inner = self.inner.lock().expect("memory warehouse lock poisoned");
        inner.statements.push(sql.to_string());

        if let Some(table) = sql.strip_prefix("TRUNCATE TABLE ") {
            inner.tables.remove(table.trim());
        }

        Ok(())
    }
}
