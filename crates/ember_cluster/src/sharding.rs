//! Row placement: hashing distribution-key values onto the shard map.

use ember_common::datum::{Datum, OwnedRow};
use ember_common::schema::TableSchema;
use ember_common::types::ShardId;
use ember_executor::RowOwnership;
use xxhash_rust::xxh3::xxh3_64;

use crate::shard_map::ShardMap;

/// Hash a single distribution-key value.
///
/// Callers must first coerce the value to the key column's type so that a
/// parameter and a stored row hash identically.
pub fn compute_key_hash(datum: &Datum) -> u64 {
    let mut buf = Vec::with_capacity(16);
    encode_datum_for_hash(&mut buf, datum);
    xxh3_64(&buf)
}

/// Shard owning `key` for a hash-distributed table.
pub fn shard_for_key(key: &Datum, shard_map: &ShardMap) -> ShardId {
    shard_map.locate_by_hash(compute_key_hash(key))
}

/// Shard owning `row`, `None` for replicated tables.
pub fn target_shard_for_row(row: &OwnedRow, schema: &TableSchema, shard_map: &ShardMap) -> Option<ShardId> {
    let key_col = schema.distribution_key()?;
    let key = row.get(key_col).unwrap_or(&Datum::Null);
    Some(shard_for_key(key, shard_map))
}

fn encode_datum_for_hash(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.push(0x00),
        Datum::Boolean(b) => {
            buf.push(0x01);
            buf.push(u8::from(*b));
        }
        Datum::Int32(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int64(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            buf.push(0x04);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Text(s) => {
            buf.push(0x05);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        Datum::Bytea(b) => {
            buf.push(0x06);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
    }
}

/// Ownership rule used by a shard when it applies writes.
pub struct HashOwnership<'a> {
    pub shard: ShardId,
    pub shard_map: &'a ShardMap,
}

impl RowOwnership for HashOwnership<'_> {
    fn owns(&self, schema: &TableSchema, row: &OwnedRow) -> bool {
        match target_shard_for_row(row, schema, self.shard_map) {
            Some(owner) => owner == self.shard,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::schema::{ColumnDef, Distribution};
    use ember_common::types::{DataType, TableId};

    #[test]
    fn test_hash_is_type_tagged() {
        assert_ne!(compute_key_hash(&Datum::Int32(1)), compute_key_hash(&Datum::Int64(1)));
        assert_eq!(compute_key_hash(&Datum::Text("a".into())), compute_key_hash(&Datum::Text("a".into())));
    }

    #[test]
    fn test_ownership_partitions_rows() {
        let map = ShardMap::uniform(3);
        let schema = TableSchema {
            id: TableId(1),
            name: "t".into(),
            columns: vec![ColumnDef::new("k", DataType::Int32)],
            distribution: Distribution::Hash { key_column: 0 },
        };
        for k in 0..50 {
            let row = OwnedRow::new(vec![Datum::Int32(k)]);
            let owners = map
                .shard_ids()
                .into_iter()
                .filter(|&shard| HashOwnership { shard, shard_map: &map }.owns(&schema, &row))
                .count();
            assert_eq!(owners, 1, "key {k} must have exactly one owner");
        }
    }

    #[test]
    fn test_replicated_rows_owned_everywhere() {
        let map = ShardMap::uniform(2);
        let schema = TableSchema {
            id: TableId(2),
            name: "r".into(),
            columns: vec![ColumnDef::new("k", DataType::Int32)],
            distribution: Distribution::Replicated,
        };
        let row = OwnedRow::new(vec![Datum::Int32(1)]);
        assert!(target_shard_for_row(&row, &schema, &map).is_none());
        assert!(HashOwnership { shard: ShardId(1), shard_map: &map }.owns(&schema, &row));
    }
}
