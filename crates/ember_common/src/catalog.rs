use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SqlError;
use crate::schema::{ColumnDef, Distribution, TableSchema};
use crate::types::TableId;

/// Shared relation catalog.
///
/// Every DDL change bumps `generation`; cached plans and routing decisions
/// stamped with an older generation must be revalidated before use.
#[derive(Debug)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
    next_table_id: AtomicU64,
    generation: AtomicU64,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_table_id: AtomicU64::new(1),
            generation: AtomicU64::new(1),
        }
    }

    /// Current catalog generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDef>,
        distribution: Distribution,
    ) -> Result<Arc<TableSchema>, SqlError> {
        let key = name.to_ascii_lowercase();
        let mut tables = self.tables.write();
        if tables.contains_key(&key) {
            return Err(SqlError::DuplicateTable(name.to_string()));
        }
        if let Distribution::Hash { key_column } = distribution {
            if key_column >= columns.len() {
                return Err(SqlError::InvalidExpression(format!(
                    "distribution column {key_column} out of range"
                )));
            }
        }
        let schema = Arc::new(TableSchema {
            id: TableId(self.next_table_id.fetch_add(1, Ordering::Relaxed)),
            name: key.clone(),
            columns,
            distribution,
        });
        tables.insert(key, schema.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(table = %schema.name, id = %schema.id, "catalog: table created");
        Ok(schema)
    }

    pub fn drop_table(&self, name: &str) -> Option<Arc<TableSchema>> {
        let removed = self.tables.write().remove(&name.to_ascii_lowercase());
        if let Some(schema) = &removed {
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(table = %schema.name, id = %schema.id, "catalog: table dropped");
        }
        removed
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn get_table_by_id(&self, id: TableId) -> Option<Arc<TableSchema>> {
        self.tables.read().values().find(|t| t.id == id).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
