//! Decoder for the source's text-mode bulk-copy stream.
//!
//! Parses one copy line into per-column tuples and routes each selected
//! column through the [`ColumnConverter`] seam, writing the converted values
//! tab-separated to the output buffer.
//!
//! Escape handling is deliberately conservative: the single-character escape
//! pairs (`\b \f \n \r \t \v \\`) are preserved as-is so the converted output
//! stays format-neutral, while `\xHH` and `\ooo` are decoded to raw bytes and
//! `\N` marks the column as NULL.

use std::collections::HashMap;

use bytes::Bytes;
use chetl_postgres::types::{ColumnSchema, Tuple, TupleKind};

use crate::chetl_error;
use crate::conversions::ColumnConverter;
use crate::error::{ChetlError, ChetlResult, ErrorKind};

/// Decodes one line of the text copy stream.
///
/// `columns` maps zero-based source column indexes to the descriptors of the
/// columns to forward; columns absent from the map are skipped but still
/// advance the index. A tab is written between emitted columns. The trailing
/// newline is optional.
pub fn decode_copy_line(
    line: &[u8],
    columns: &HashMap<usize, ColumnSchema>,
    converter: &dyn ColumnConverter,
    out: &mut Vec<u8>,
) -> ChetlResult<()> {
    if line.is_empty() {
        return Ok(());
    }

    let mut col_buf: Vec<u8> = Vec::new();
    let mut kind = TupleKind::Text;
    let mut col_id = 0usize;
    let mut emitted = 0usize;

    let n = line.len();
    let mut i = 0usize;
    while i < n {
        let byte = line[i];

        if byte == b'\t' {
            flush_column(columns, converter, col_id, kind, &mut col_buf, &mut emitted, out)?;
            kind = TupleKind::Text;
            col_id += 1;
            i += 1;
            continue;
        }

        if byte == b'\n' {
            return flush_column(columns, converter, col_id, kind, &mut col_buf, &mut emitted, out);
        }

        if byte != b'\\' {
            col_buf.push(byte);
            i += 1;
            continue;
        }

        i += 1;
        if i >= n {
            return Err(bad_escape(&line[i - 1..]));
        }

        let ch = line[i];
        if ch == b'N' {
            kind = TupleKind::Null;
            i += 1;
            continue;
        }

        match ch {
            b'b' | b'f' | b'n' | b'r' | b't' | b'v' | b'\\' => {
                col_buf.push(b'\\');
                col_buf.push(ch);
                i += 1;
                continue;
            }
            _ => {}
        }

        if ch == b'x' {
            // \x is followed by 1 or 2 hex digits.
            i += 1;
            if i >= n {
                return Err(bad_escape(&line[i - 2..]));
            }

            let Some(mut digit) = decode_hex_digit(line[i]) else {
                return Err(bad_escape(&line[i - 2..=i]));
            };
            if i + 1 < n
                && let Some(low) = decode_hex_digit(line[i + 1])
            {
                i += 1;
                digit = (digit << 4) + low;
            }
            col_buf.push(digit);
            i += 1;
            continue;
        }

        if let Some(mut digit) = decode_oct_digit(ch) {
            // 1 to 2 more octal digits follow.
            for _ in 0..2 {
                if i + 1 < n
                    && let Some(next) = decode_oct_digit(line[i + 1])
                {
                    i += 1;
                    digit = (digit << 3) + next;
                }
            }
            col_buf.push(digit);
            i += 1;
            continue;
        }

        return Err(bad_escape(&line[i - 1..=i]));
    }

    // Input without a trailing newline: the end of the line ends the row.
    flush_column(columns, converter, col_id, kind, &mut col_buf, &mut emitted, out)
}

/// Ends the current column: converts and emits it when selected by the
/// column map, then resets the column buffer.
fn flush_column(
    columns: &HashMap<usize, ColumnSchema>,
    converter: &dyn ColumnConverter,
    col_id: usize,
    kind: TupleKind,
    col_buf: &mut Vec<u8>,
    emitted: &mut usize,
    out: &mut Vec<u8>,
) -> ChetlResult<()> {
    if let Some(column) = columns.get(&col_id) {
        if *emitted > 0 {
            out.push(b'\t');
        }

        let tuple = match kind {
            // NULL discards any accumulated column content.
            TupleKind::Null => Tuple::null(),
            _ => Tuple {
                kind,
                value: Bytes::from(std::mem::take(col_buf)),
            },
        };
        converter.convert(out, column, &tuple)?;
        *emitted += 1;
    }

    col_buf.clear();
    Ok(())
}

fn decode_hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_oct_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'7' => Some(c - b'0'),
        _ => None,
    }
}

fn bad_escape(sequence: &[u8]) -> ChetlError {
    chetl_error!(
        ErrorKind::CopyDecodeFailed,
        "Unknown escape sequence in copy stream",
        format!("{:?}", String::from_utf8_lossy(sequence))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::TextConverter;

    fn column(name: &str) -> ColumnSchema {
        ColumnSchema {
            is_key: false,
            name: name.to_string(),
            type_oid: 25,
            modifier: -1,
        }
    }

    fn all_columns(count: usize) -> HashMap<usize, ColumnSchema> {
        (0..count).map(|i| (i, column(&format!("c{i}")))).collect()
    }

    fn decode(line: &[u8], columns: &HashMap<usize, ColumnSchema>) -> ChetlResult<Vec<u8>> {
        let mut out = Vec::new();
        decode_copy_line(line, columns, &TextConverter, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_simple_columns() {
        let out = decode(b"1\tabc\n", &all_columns(2)).unwrap();
        assert_eq!(out, b"1\tabc");

        // The trailing newline is optional.
        let out = decode(b"1\tabc", &all_columns(2)).unwrap();
        assert_eq!(out, b"1\tabc");
    }

    #[test]
    fn test_skipped_columns_advance_the_index() {
        let mut columns = HashMap::new();
        columns.insert(0, column("c0"));
        columns.insert(2, column("c2"));

        let out = decode(b"a\tb\tc\n", &columns).unwrap();
        assert_eq!(out, b"a\tc");
    }

    #[test]
    fn test_leading_skipped_column_emits_no_leading_tab() {
        let mut columns = HashMap::new();
        columns.insert(1, column("c1"));

        let out = decode(b"a\tb\n", &columns).unwrap();
        assert_eq!(out, b"b");
    }

    #[test]
    fn test_null_discards_column_content() {
        let out = decode(b"\\N\t2\n", &all_columns(2)).unwrap();
        assert_eq!(out, b"\\N\t2");
    }

    #[test]
    fn test_escape_pairs_are_preserved() {
        let out = decode(b"a\\tb\\\\c\\n\n", &all_columns(1)).unwrap();
        assert_eq!(out, b"a\\tb\\\\c\\n");
    }

    #[test]
    fn test_hex_escapes_are_decoded() {
        let out = decode(b"\\x41\\x9z\n", &all_columns(1)).unwrap();
        assert_eq!(out, b"A\x09z");
    }

    #[test]
    fn test_octal_escapes_are_decoded() {
        let out = decode(b"\\101\\7q\n", &all_columns(1)).unwrap();
        assert_eq!(out, b"A\x07q");
    }

    #[test]
    fn test_bad_escapes() {
        assert_eq!(
            decode(b"\\q\n", &all_columns(1)).unwrap_err().kind(),
            ErrorKind::CopyDecodeFailed
        );
        assert_eq!(
            decode(b"abc\\", &all_columns(1)).unwrap_err().kind(),
            ErrorKind::CopyDecodeFailed
        );
        assert_eq!(
            decode(b"\\xzz\n", &all_columns(1)).unwrap_err().kind(),
            ErrorKind::CopyDecodeFailed
        );
    }

    /// Escapes arbitrary bytes the way the source's copy format does, using
    /// octal sequences for everything the decoder maps back to raw bytes.
    fn escape_copy_bytes(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &byte in data {
            if byte == b'\\' || byte == b'\t' || byte == b'\n' || byte < 0x20 || byte >= 0x7f {
                out.push(b'\\');
                out.extend_from_slice(format!("{byte:03o}").as_bytes());
            } else {
                out.push(byte);
            }
        }
        out
    }

    #[test]
    fn test_escape_round_trip() {
        let samples: &[&[u8]] = &[
            b"plain",
            b"tab\there",
            b"new\nline",
            b"back\\slash",
            &[0x00, 0x01, 0x1f, 0x7f, 0xff],
            b"mixed \t\n\\ \x02 content",
        ];

        for sample in samples {
            let escaped = escape_copy_bytes(sample);
            let out = decode(&escaped, &all_columns(1)).unwrap();
            assert_eq!(&out, sample, "round trip mismatch for {sample:?}");
        }
    }
}
