use serde::{Deserialize, Serialize};

use crate::types::{DataType, TableId};

/// How a table's rows are placed across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Rows are assigned to shards by hashing one column.
    Hash { key_column: usize },
    /// Every shard holds a full copy.
    Replicated,
}

/// Column definition in a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Table schema metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub distribution: Distribution,
}

impl TableSchema {
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Index of the distribution key column, `None` for replicated tables.
    pub fn distribution_key(&self) -> Option<usize> {
        match self.distribution {
            Distribution::Hash { key_column } => Some(key_column),
            Distribution::Replicated => None,
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self.distribution, Distribution::Replicated)
    }

    pub fn column_type(&self, idx: usize) -> Option<DataType> {
        self.columns.get(idx).map(|c| c.data_type)
    }
}
