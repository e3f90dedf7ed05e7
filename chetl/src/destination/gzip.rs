use std::io::{BufWriter, Write};

use bytes::Bytes;
use chetl_config::shared::GzipComprLevel;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::chetl_error;
use crate::destination::{ContentEncoding, UploadBody};
use crate::error::{ChetlResult, ErrorKind};

/// Builds an [`UploadBody`] from raw rows, applying the configured gzip
/// level.
pub fn compress_body(
    rows: Vec<u8>,
    level: GzipComprLevel,
    gzip_buf_size: usize,
) -> ChetlResult<UploadBody> {
    let compression = match level {
        GzipComprLevel::None => {
            return Ok(UploadBody {
                encoding: ContentEncoding::Plain,
                bytes: Bytes::from(rows),
            });
        }
        GzipComprLevel::Fast => Compression::fast(),
        GzipComprLevel::Default => Compression::default(),
        GzipComprLevel::Best => Compression::best(),
    };

    let encoder = GzEncoder::new(Vec::with_capacity(rows.len() / 4), compression);
    let mut writer = BufWriter::with_capacity(gzip_buf_size.max(1), encoder);

    let result = (|| {
        writer.write_all(&rows)?;
        writer.into_inner().map_err(|e| e.into_error())?.finish()
    })();

    let compressed = result.map_err(|e| {
        chetl_error!(ErrorKind::DestinationError, "Gzip compression failed").with_source(e)
    })?;

    Ok(UploadBody {
        encoding: ContentEncoding::Gzip,
        bytes: Bytes::from(compressed),
    })
}
