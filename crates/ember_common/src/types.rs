use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a table within the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Unique identifier for a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

/// Coordinator-assigned transaction identifier, shared by every shard the
/// transaction touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Backend process identifier handed to clients in BackendKeyData.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i32);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess:{}", self.0)
    }
}

/// PG OID meaning "no type declared" in a Parse message.
pub const UNSPECIFIED_OID: i32 = 0;

/// SQL data types understood by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Text,
    Bytea,
}

impl DataType {
    /// Return the PG OID for this type.
    pub fn pg_oid(&self) -> i32 {
        match self {
            DataType::Boolean => 16,
            DataType::Int32 => 23,
            DataType::Int64 => 20,
            DataType::Float64 => 701,
            DataType::Text => 25,
            DataType::Bytea => 17,
        }
    }

    /// Resolve a client-declared OID. `varchar` and `unknown` collapse to text.
    pub fn from_pg_oid(oid: i32) -> Option<DataType> {
        match oid {
            16 => Some(DataType::Boolean),
            23 => Some(DataType::Int32),
            20 => Some(DataType::Int64),
            701 => Some(DataType::Float64),
            25 | 1043 | 705 => Some(DataType::Text),
            17 => Some(DataType::Bytea),
            _ => None,
        }
    }

    /// Byte size hint (-1 for variable length).
    pub fn type_len(&self) -> i16 {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Float64 => 8,
            DataType::Text | DataType::Bytea => -1,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64 | DataType::Float64)
    }

    /// Map a SQL type name (as written in DDL) to a data type.
    pub fn from_sql_name(name: &str) -> Option<DataType> {
        let lower = name.trim().to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or("").trim();
        match base {
            "bool" | "boolean" => Some(DataType::Boolean),
            "int" | "integer" | "int4" | "smallint" | "int2" => Some(DataType::Int32),
            "bigint" | "int8" => Some(DataType::Int64),
            "double" | "double precision" | "float8" | "float" | "real" | "float4" => {
                Some(DataType::Float64)
            }
            "text" | "varchar" | "character varying" | "string" | "char" | "character" => {
                Some(DataType::Text)
            }
            "bytea" => Some(DataType::Bytea),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int32 => "integer",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double precision",
            DataType::Text => "text",
            DataType::Bytea => "bytea",
        };
        f.write_str(name)
    }
}

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_i16(code: i16) -> Option<FormatCode> {
        match code {
            0 => Some(FormatCode::Text),
            1 => Some(FormatCode::Binary),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_aliases_collapse_to_text() {
        assert_eq!(DataType::from_pg_oid(1043), Some(DataType::Text));
        assert_eq!(DataType::from_pg_oid(705), Some(DataType::Text));
        assert_eq!(DataType::from_pg_oid(1114), None);
    }

    #[test]
    fn test_sql_type_names() {
        assert_eq!(DataType::from_sql_name("INT"), Some(DataType::Int32));
        assert_eq!(DataType::from_sql_name("varchar(32)"), Some(DataType::Text));
        assert_eq!(DataType::from_sql_name("DOUBLE PRECISION"), Some(DataType::Float64));
        assert_eq!(DataType::from_sql_name("jsonb"), None);
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(FormatCode::from_i16(1), Some(FormatCode::Binary));
        assert_eq!(FormatCode::from_i16(2), None);
    }
}
