use std::fmt;

/// An object identifier in Postgres.
pub type Oid = u32;

/// A fully qualified Postgres table name consisting of a schema and table name.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct TableName {
    /// The schema name containing the table.
    pub schema: String,
    /// The name of the table within the schema.
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the key under which durable state for this table is stored.
    pub fn key_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// The replica identity configured for a relation.
///
/// Tells the source which columns are included in the old tuple of updates
/// and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    /// Old tuple carries the primary key columns.
    Default,
    /// No old tuple is sent.
    Nothing,
    /// Old tuple carries all columns.
    Full,
    /// Old tuple carries the columns of the configured identity index.
    Index,
}

impl ReplicaIdentity {
    /// Decodes the single-byte wire representation.
    pub fn from_wire(byte: u8) -> Option<ReplicaIdentity> {
        match byte {
            b'd' => Some(ReplicaIdentity::Default),
            b'n' => Some(ReplicaIdentity::Nothing),
            b'f' => Some(ReplicaIdentity::Full),
            b'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }

    /// Encodes to the single-byte wire representation.
    pub fn to_wire(self) -> u8 {
        match self {
            ReplicaIdentity::Default => b'd',
            ReplicaIdentity::Nothing => b'n',
            ReplicaIdentity::Full => b'f',
            ReplicaIdentity::Index => b'i',
        }
    }
}

/// Schema of a single column as delivered by a relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Whether the column is part of the replica identity key.
    pub is_key: bool,
    /// The name of the column.
    pub name: String,
    /// OID of the column's data type.
    pub type_oid: Oid,
    /// Type-specific modifier value (e.g., length for varchar).
    pub modifier: i32,
}

/// Schema of a relation as delivered at the start of a logical stream and on
/// every schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    /// OID of the relation.
    pub oid: Oid,
    /// Schema (namespace) containing the relation.
    pub namespace: String,
    /// Name of the relation.
    pub name: String,
    /// Replica identity policy of the relation.
    pub replica_identity: ReplicaIdentity,
    /// Column schemas in table column order.
    pub columns: Vec<ColumnSchema>,
}

impl RelationSchema {
    /// Returns the fully qualified [`TableName`] of this relation.
    pub fn table_name(&self) -> TableName {
        TableName::new(self.namespace.clone(), self.name.clone())
    }

    /// Compares everything the target mapping depends on.
    ///
    /// The OID is excluded: a table rewrite changes the OID without changing
    /// the structure, and the engine only has to fail when the structure
    /// itself drifted.
    pub fn same_structure(&self, other: &RelationSchema) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.replica_identity == other.replica_identity
            && self.columns == other.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_relation() -> RelationSchema {
        RelationSchema {
            oid: 16384,
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

    #[test]
    fn test_same_structure_ignores_oid() {
        let a = sample_relation();
        let mut b = sample_relation();
        b.oid = 99999;
        assert!(a.same_structure(&b));
    }

    #[test]
    fn test_same_structure_detects_column_drift() {
        let a = sample_relation();

        let mut renamed = sample_relation();
        renamed.columns[1].name = "full_name".to_string();
        assert!(!a.same_structure(&renamed));

        let mut retyped = sample_relation();
        retyped.columns[1].type_oid = 1043;
        assert!(!a.same_structure(&retyped));

        let mut extended = sample_relation();
        extended.columns.push(ColumnSchema {
            is_key: false,
            name: "created_at".to_string(),
            type_oid: 1114,
            modifier: -1,
        });
        assert!(!a.same_structure(&extended));
    }

    #[test]
    fn test_key_name() {
        assert_eq!(sample_relation().table_name().key_name(), "public.users");
    }
}
