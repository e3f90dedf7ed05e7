use bytes::Bytes;

/// The kind of a single column value in a replicated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleKind {
    /// A text-format value.
    Text,
    /// SQL NULL.
    Null,
    /// Placeholder in the old row of an update for a column that was not part
    /// of the replica identity change set. Never data; consumers must treat
    /// it as "same as previous".
    Unchanged,
}

/// One column value of a replicated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub kind: TupleKind,
    pub value: Bytes,
}

impl Tuple {
    /// Creates a text tuple carrying the given value bytes.
    pub fn text(value: impl Into<Bytes>) -> Tuple {
        Tuple {
            kind: TupleKind::Text,
            value: value.into(),
        }
    }

    /// Creates a NULL tuple.
    pub fn null() -> Tuple {
        Tuple {
            kind: TupleKind::Null,
            value: Bytes::new(),
        }
    }

    /// Creates an unchanged placeholder tuple.
    pub fn unchanged() -> Tuple {
        Tuple {
            kind: TupleKind::Unchanged,
            value: Bytes::new(),
        }
    }
}

/// An ordered sequence of tuples; the length equals the relation's column
/// count.
pub type Row = Vec<Tuple>;
