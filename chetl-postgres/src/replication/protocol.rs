//! Logical replication wire protocol decoder.
//!
//! Decodes one binary logical replication message into a typed
//! [`LogicalMessage`]. All multi-byte integers on the wire are big-endian,
//! strings are NUL-terminated, and timestamps count microseconds since
//! 2000-01-01T00:00:00Z.
//!
//! The inverse [`LogicalMessage::encode`] produces the exact wire bytes and
//! backs both the round-trip tests and the in-memory replication source used
//! in integration tests.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{
    ColumnSchema, Lsn, Oid, RelationSchema, ReplicaIdentity, Row, Tuple, TupleKind,
};

/// Unix timestamp of the Postgres timestamp epoch, 2000-01-01T00:00:00Z.
const POSTGRES_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Errors produced while decoding a wire message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A read crossed the end of the input buffer.
    #[error("message truncated: a read crossed the end of the buffer")]
    ShortBuffer,
    /// The leading type tag (or an inner kind tag) is not one the protocol
    /// produces.
    #[error("unknown message or tuple kind tag: {0:#04x}")]
    UnknownType(u8),
    /// A string field had no NUL terminator or was not valid UTF-8.
    #[error("malformed string: missing NUL terminator or invalid UTF-8")]
    BadString,
}

/// Transaction begin message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginBody {
    /// LSN at which the transaction will commit.
    pub final_lsn: Lsn,
    /// Commit timestamp of the transaction.
    pub timestamp: DateTime<Utc>,
    /// Transaction id.
    pub xid: u32,
}

/// Transaction commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBody {
    /// Commit flags; currently unused by the source.
    pub flags: u8,
    /// LSN of the commit record.
    pub lsn: Lsn,
    /// End LSN of the transaction.
    pub tx_lsn: Lsn,
    /// Commit timestamp of the transaction.
    pub timestamp: DateTime<Utc>,
}

/// Replication origin message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBody {
    /// Commit LSN on the origin server.
    pub lsn: Lsn,
    /// Name of the origin.
    pub name: String,
}

/// Type metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBody {
    /// OID of the data type.
    pub oid: Oid,
    /// Schema of the data type.
    pub namespace: String,
    /// Name of the data type.
    pub name: String,
}

/// Row insert message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBody {
    /// OID of the relation the row belongs to.
    pub relation_oid: Oid,
    /// Whether the marker byte announced a new tuple.
    pub is_new: bool,
    /// The inserted row.
    pub new_row: Row,
}

/// Row update message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBody {
    /// OID of the relation the row belongs to.
    pub relation_oid: Oid,
    /// The old row carries only the replica identity key columns.
    pub is_key: bool,
    /// The old row carries the full previous row.
    pub is_old: bool,
    /// Previous row, present when `is_key` or `is_old` is set.
    pub old_row: Option<Row>,
    /// New row after the update.
    pub new_row: Row,
}

/// Row delete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBody {
    /// OID of the relation the row belongs to.
    pub relation_oid: Oid,
    /// The old row carries only the replica identity key columns.
    pub is_key: bool,
    /// The old row carries the full previous row.
    pub is_old: bool,
    /// The deleted row.
    pub old_row: Row,
}

/// Table truncate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateBody {
    /// OIDs of the truncated relations.
    pub relation_oids: Vec<Oid>,
    /// The truncate cascaded to referencing tables.
    pub cascade: bool,
    /// Identity sequences were restarted.
    pub restart_identity: bool,
}

/// One decoded logical replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationSchema),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

const TRUNCATE_CASCADE_BIT: u8 = 1;
const TRUNCATE_RESTART_IDENTITY_BIT: u8 = 2;

impl LogicalMessage {
    /// Parses one logical replication message from its wire bytes.
    ///
    /// The first byte is the message type tag; the remaining bytes are the
    /// big-endian body.
    pub fn parse(src: &[u8]) -> Result<LogicalMessage, DecodeError> {
        let mut r = Reader::new(src);

        match r.u8()? {
            b'B' => Ok(LogicalMessage::Begin(BeginBody {
                final_lsn: r.lsn()?,
                timestamp: r.timestamp()?,
                xid: r.u32()?,
            })),
            b'C' => Ok(LogicalMessage::Commit(CommitBody {
                flags: r.u8()?,
                lsn: r.lsn()?,
                tx_lsn: r.lsn()?,
                timestamp: r.timestamp()?,
            })),
            b'O' => Ok(LogicalMessage::Origin(OriginBody {
                lsn: r.lsn()?,
                name: r.cstring()?,
            })),
            b'R' => {
                let oid = r.oid()?;
                let namespace = r.cstring()?;
                let name = r.cstring()?;
                let identity = r.u8()?;
                let replica_identity =
                    ReplicaIdentity::from_wire(identity).ok_or(DecodeError::UnknownType(identity))?;
                let columns = r.column_list()?;

                Ok(LogicalMessage::Relation(RelationSchema {
                    oid,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                }))
            }
            b'Y' => Ok(LogicalMessage::Type(TypeBody {
                oid: r.oid()?,
                namespace: r.cstring()?,
                name: r.cstring()?,
            })),
            b'I' => Ok(LogicalMessage::Insert(InsertBody {
                relation_oid: r.oid()?,
                is_new: r.u8()? == b'N',
                new_row: r.tuple_list()?,
            })),
            b'U' => {
                let relation_oid = r.oid()?;
                let is_key = r.row_info(b'K')?;
                let is_old = r.row_info(b'O')?;
                let old_row = if is_key || is_old {
                    Some(r.tuple_list()?)
                } else {
                    None
                };

                let marker = r.u8()?;
                if marker != b'N' {
                    return Err(DecodeError::UnknownType(marker));
                }
                let new_row = r.tuple_list()?;

                Ok(LogicalMessage::Update(UpdateBody {
                    relation_oid,
                    is_key,
                    is_old,
                    old_row,
                    new_row,
                }))
            }
            b'D' => Ok(LogicalMessage::Delete(DeleteBody {
                relation_oid: r.oid()?,
                is_key: r.row_info(b'K')?,
                is_old: r.row_info(b'O')?,
                old_row: r.tuple_list()?,
            })),
            b'T' => {
                let relations = r.u32()? as usize;
                let options = r.u8()?;
                let cascade = options & TRUNCATE_CASCADE_BIT != 0;
                let restart_identity = options & TRUNCATE_RESTART_IDENTITY_BIT != 0;

                let mut relation_oids = Vec::with_capacity(relations);
                for _ in 0..relations {
                    relation_oids.push(r.oid()?);
                }

                Ok(LogicalMessage::Truncate(TruncateBody {
                    relation_oids,
                    cascade,
                    restart_identity,
                }))
            }
            tag => Err(DecodeError::UnknownType(tag)),
        }
    }

    /// Encodes this message back to its wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        match self {
            LogicalMessage::Begin(m) => {
                out.push(b'B');
                write_lsn(&mut out, m.final_lsn);
                write_timestamp(&mut out, m.timestamp);
                out.extend_from_slice(&m.xid.to_be_bytes());
            }
            LogicalMessage::Commit(m) => {
                out.push(b'C');
                out.push(m.flags);
                write_lsn(&mut out, m.lsn);
                write_lsn(&mut out, m.tx_lsn);
                write_timestamp(&mut out, m.timestamp);
            }
            LogicalMessage::Origin(m) => {
                out.push(b'O');
                write_lsn(&mut out, m.lsn);
                write_cstring(&mut out, &m.name);
            }
            LogicalMessage::Relation(m) => {
                out.push(b'R');
                out.extend_from_slice(&m.oid.to_be_bytes());
                write_cstring(&mut out, &m.namespace);
                write_cstring(&mut out, &m.name);
                out.push(m.replica_identity.to_wire());
                out.extend_from_slice(&(m.columns.len() as u16).to_be_bytes());
                for column in &m.columns {
                    out.push(column.is_key as u8);
                    write_cstring(&mut out, &column.name);
                    out.extend_from_slice(&column.type_oid.to_be_bytes());
                    out.extend_from_slice(&column.modifier.to_be_bytes());
                }
            }
            LogicalMessage::Type(m) => {
                out.push(b'Y');
                out.extend_from_slice(&m.oid.to_be_bytes());
                write_cstring(&mut out, &m.namespace);
                write_cstring(&mut out, &m.name);
            }
            LogicalMessage::Insert(m) => {
                out.push(b'I');
                out.extend_from_slice(&m.relation_oid.to_be_bytes());
                out.push(if m.is_new { b'N' } else { 0 });
                write_tuple_list(&mut out, &m.new_row);
            }
            LogicalMessage::Update(m) => {
                out.push(b'U');
                out.extend_from_slice(&m.relation_oid.to_be_bytes());
                if let Some(old_row) = &m.old_row {
                    out.push(if m.is_key { b'K' } else { b'O' });
                    write_tuple_list(&mut out, old_row);
                }
                out.push(b'N');
                write_tuple_list(&mut out, &m.new_row);
            }
            LogicalMessage::Delete(m) => {
                out.push(b'D');
                out.extend_from_slice(&m.relation_oid.to_be_bytes());
                if m.is_key {
                    out.push(b'K');
                } else if m.is_old {
                    out.push(b'O');
                }
                write_tuple_list(&mut out, &m.old_row);
            }
            LogicalMessage::Truncate(m) => {
                out.push(b'T');
                out.extend_from_slice(&(m.relation_oids.len() as u32).to_be_bytes());
                let mut options = 0u8;
                if m.cascade {
                    options |= TRUNCATE_CASCADE_BIT;
                }
                if m.restart_identity {
                    options |= TRUNCATE_RESTART_IDENTITY_BIT;
                }
                out.push(options);
                for oid in &m.relation_oids {
                    out.extend_from_slice(&oid.to_be_bytes());
                }
            }
        }

        out
    }

    /// Returns a short static name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LogicalMessage::Begin(_) => "Begin",
            LogicalMessage::Commit(_) => "Commit",
            LogicalMessage::Origin(_) => "Origin",
            LogicalMessage::Relation(_) => "Relation",
            LogicalMessage::Type(_) => "Type",
            LogicalMessage::Insert(_) => "Insert",
            LogicalMessage::Update(_) => "Update",
            LogicalMessage::Delete(_) => "Delete",
            LogicalMessage::Truncate(_) => "Truncate",
        }
    }
}

/// Checked big-endian reader over a message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::ShortBuffer)?;
        if end > self.buf.len() {
            return Err(DecodeError::ShortBuffer);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn oid(&mut self) -> Result<Oid, DecodeError> {
        self.u32()
    }

    fn lsn(&mut self) -> Result<Lsn, DecodeError> {
        Ok(Lsn::new(self.u64()?))
    }

    /// Reads bytes up to and including a NUL terminator; the terminator is
    /// stripped from the returned string.
    fn cstring(&mut self) -> Result<String, DecodeError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::BadString)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| DecodeError::BadString)?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }

    /// Interprets 8 bytes as microseconds since the year-2000 epoch.
    fn timestamp(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        let micros = self.u64()? as i64;
        Ok(postgres_epoch() + Duration::microseconds(micros))
    }

    /// Peek-and-consume marker: consumes the next byte and returns `true` if
    /// it matches `tag`, otherwise pushes it back and returns `false`.
    fn row_info(&mut self, tag: u8) -> Result<bool, DecodeError> {
        if self.u8()? == tag {
            return Ok(true);
        }
        self.pos -= 1;
        Ok(false)
    }

    /// Reads a 16-bit tuple count followed by that many tuples.
    fn tuple_list(&mut self) -> Result<Row, DecodeError> {
        let count = self.u16()? as usize;
        let mut row = Vec::with_capacity(count);

        for _ in 0..count {
            match self.u8()? {
                b't' => {
                    let len = self.u32()? as usize;
                    let value = Bytes::copy_from_slice(self.take(len)?);
                    row.push(Tuple {
                        kind: TupleKind::Text,
                        value,
                    });
                }
                b'n' => row.push(Tuple::null()),
                b'u' => row.push(Tuple::unchanged()),
                kind => return Err(DecodeError::UnknownType(kind)),
            }
        }

        Ok(row)
    }

    /// Reads a 16-bit column count followed by that many column records.
    fn column_list(&mut self) -> Result<Vec<ColumnSchema>, DecodeError> {
        let count = self.u16()? as usize;
        let mut columns = Vec::with_capacity(count);

        for _ in 0..count {
            columns.push(ColumnSchema {
                is_key: self.bool()?,
                name: self.cstring()?,
                type_oid: self.oid()?,
                modifier: self.i32()?,
            });
        }

        Ok(columns)
    }
}

fn postgres_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(POSTGRES_EPOCH_UNIX_SECS, 0)
        .expect("the year-2000 epoch is representable")
}

fn write_lsn(out: &mut Vec<u8>, lsn: Lsn) {
    out.extend_from_slice(&lsn.decimal().to_be_bytes());
}

fn write_timestamp(out: &mut Vec<u8>, ts: DateTime<Utc>) {
    let micros = (ts - postgres_epoch()).num_microseconds().unwrap_or(0);
    out.extend_from_slice(&(micros as u64).to_be_bytes());
}

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_tuple_list(out: &mut Vec<u8>, row: &Row) {
    out.extend_from_slice(&(row.len() as u16).to_be_bytes());
    for tuple in row {
        match tuple.kind {
            TupleKind::Text => {
                out.push(b't');
                out.extend_from_slice(&(tuple.value.len() as u32).to_be_bytes());
                out.extend_from_slice(&tuple.value);
            }
            TupleKind::Null => out.push(b'n'),
            TupleKind::Unchanged => out.push(b'u'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_timestamp() -> DateTime<Utc> {
        postgres_epoch() + Duration::microseconds(1_705_000_000_000_000)
    }

    fn sample_relation() -> RelationSchema {
        RelationSchema {
            oid: 16384,
            namespace: "public".to_string(),
            name: "orders".to_string(),
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
                    name: "amount".to_string(),
                    type_oid: 1700,
                    modifier: 655366,
                },
            ],
        }
    }

    #[test]
    fn test_decode_begin_from_raw_bytes() {
        let mut data = vec![b'B'];
        data.extend_from_slice(&0x0000_0001_0000_0000u64.to_be_bytes());
        data.extend_from_slice(&1_705_000_000_000_000u64.to_be_bytes());
        data.extend_from_slice(&731u32.to_be_bytes());

        let LogicalMessage::Begin(body) = LogicalMessage::parse(&data).unwrap() else {
            panic!("expected Begin");
        };

        assert_eq!(body.final_lsn, Lsn::new(0x0000_0001_0000_0000));
        assert_eq!(body.xid, 731);
        assert_eq!(
            body.timestamp,
            postgres_epoch() + Duration::microseconds(1_705_000_000_000_000)
        );
    }

    #[test]
    fn test_unknown_leading_tag() {
        assert_eq!(
            LogicalMessage::parse(&[b'Z', 0, 0]),
            Err(DecodeError::UnknownType(b'Z'))
        );
    }

    #[test]
    fn test_short_buffer() {
        let data = [b'B', 0, 0, 1];
        assert_eq!(LogicalMessage::parse(&data), Err(DecodeError::ShortBuffer));
    }

    #[test]
    fn test_missing_nul_terminator() {
        let mut data = vec![b'O'];
        data.extend_from_slice(&7u64.to_be_bytes());
        data.extend_from_slice(b"origin-without-nul");
        assert_eq!(LogicalMessage::parse(&data), Err(DecodeError::BadString));
    }

    #[test]
    fn test_unknown_tuple_kind() {
        let mut data = vec![b'I'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&1u16.to_be_bytes());
        data.push(b'x');
        assert_eq!(
            LogicalMessage::parse(&data),
            Err(DecodeError::UnknownType(b'x'))
        );
    }

    #[test]
    fn test_truncate_restart_identity_bit_alone() {
        // options = 2 sets only the restart-identity bit; the cascade bit is
        // clear. A `== 1` comparison would misread this byte.
        let mut data = vec![b'T'];
        data.extend_from_slice(&1u32.to_be_bytes());
        data.push(2);
        data.extend_from_slice(&16384u32.to_be_bytes());

        let LogicalMessage::Truncate(body) = LogicalMessage::parse(&data).unwrap() else {
            panic!("expected Truncate");
        };

        assert!(!body.cascade);
        assert!(body.restart_identity);
        assert_eq!(body.relation_oids, vec![16384]);
    }

    #[test]
    fn test_truncate_both_bits() {
        let mut data = vec![b'T'];
        data.extend_from_slice(&2u32.to_be_bytes());
        data.push(3);
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());

        let LogicalMessage::Truncate(body) = LogicalMessage::parse(&data).unwrap() else {
            panic!("expected Truncate");
        };

        assert!(body.cascade);
        assert!(body.restart_identity);
    }

    #[test]
    fn test_update_old_row_markers() {
        let key_update = LogicalMessage::Update(UpdateBody {
            relation_oid: 16384,
            is_key: true,
            is_old: false,
            old_row: Some(vec![Tuple::text(&b"1"[..]), Tuple::null()]),
            new_row: vec![Tuple::text(&b"2"[..]), Tuple::text(&b"b"[..])],
        });
        let decoded = LogicalMessage::parse(&key_update.encode()).unwrap();
        assert_eq!(decoded, key_update);

        let full_update = LogicalMessage::Update(UpdateBody {
            relation_oid: 16384,
            is_key: false,
            is_old: true,
            old_row: Some(vec![Tuple::text(&b"1"[..]), Tuple::unchanged()]),
            new_row: vec![Tuple::text(&b"1"[..]), Tuple::text(&b"c"[..])],
        });
        let decoded = LogicalMessage::parse(&full_update.encode()).unwrap();
        assert_eq!(decoded, full_update);

        let bare_update = LogicalMessage::Update(UpdateBody {
            relation_oid: 16384,
            is_key: false,
            is_old: false,
            old_row: None,
            new_row: vec![Tuple::text(&b"1"[..])],
        });
        let decoded = LogicalMessage::parse(&bare_update.encode()).unwrap();
        assert_eq!(decoded, bare_update);
    }

    #[test]
    fn test_round_trip_all_variants() {
        let timestamp = sample_timestamp();

        let messages = vec![
            LogicalMessage::Begin(BeginBody {
                final_lsn: Lsn::new(0x16_0000_0a00),
                timestamp,
                xid: 42,
            }),
            LogicalMessage::Commit(CommitBody {
                flags: 0,
                lsn: Lsn::new(0x16_0000_0a00),
                tx_lsn: Lsn::new(0x16_0000_0b10),
                timestamp,
            }),
            LogicalMessage::Origin(OriginBody {
                lsn: Lsn::new(99),
                name: "origin".to_string(),
            }),
            LogicalMessage::Relation(sample_relation()),
            LogicalMessage::Type(TypeBody {
                oid: 12345,
                namespace: "public".to_string(),
                name: "istore".to_string(),
            }),
            LogicalMessage::Insert(InsertBody {
                relation_oid: 16384,
                is_new: true,
                new_row: vec![Tuple::text(&b"7"[..]), Tuple::null()],
            }),
            LogicalMessage::Update(UpdateBody {
                relation_oid: 16384,
                is_key: false,
                is_old: true,
                old_row: Some(vec![Tuple::text(&b"7"[..]), Tuple::unchanged()]),
                new_row: vec![Tuple::text(&b"8"[..]), Tuple::text(&b"x"[..])],
            }),
            LogicalMessage::Delete(DeleteBody {
                relation_oid: 16384,
                is_key: true,
                is_old: false,
                old_row: vec![Tuple::text(&b"7"[..])],
            }),
            LogicalMessage::Truncate(TruncateBody {
                relation_oids: vec![16384, 16385],
                cascade: true,
                restart_identity: false,
            }),
        ];

        for message in messages {
            let encoded = message.encode();
            let decoded = LogicalMessage::parse(&encoded).unwrap();
            assert_eq!(decoded, message, "round trip mismatch");
            // Decode then re-encode yields the original bytes.
            assert_eq!(decoded.encode(), encoded);
        }
    }

    #[test]
    fn test_relation_rejects_unknown_identity() {
        let mut data = vec![b'R'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.extend_from_slice(b"public\0orders\0");
        data.push(b'z');
        data.extend_from_slice(&0u16.to_be_bytes());
        assert_eq!(
            LogicalMessage::parse(&data),
            Err(DecodeError::UnknownType(b'z'))
        );
    }
}
