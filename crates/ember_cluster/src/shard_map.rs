use ember_common::types::ShardId;
use serde::{Deserialize, Serialize};

/// Information about a single shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    /// The range of hash values this shard owns: [start, end).
    pub hash_range_start: u64,
    pub hash_range_end: u64,
}

/// Shard map: maps key hashes to shards by range.
#[derive(Debug, Clone)]
pub struct ShardMap {
    shards: Vec<ShardInfo>,
}

impl ShardMap {
    /// Create an N-shard map with uniform hash ranges. The last shard's
    /// range is closed at `u64::MAX`.
    pub fn uniform(num_shards: u64) -> Self {
        let num_shards = num_shards.max(1);
        let range_size = u64::MAX / num_shards;
        let shards = (0..num_shards)
            .map(|i| ShardInfo {
                id: ShardId(i),
                hash_range_start: i * range_size,
                hash_range_end: if i == num_shards - 1 {
                    u64::MAX
                } else {
                    (i + 1) * range_size
                },
            })
            .collect();
        tracing::info!(shards = num_shards, "ShardMap: uniform layout");
        Self { shards }
    }

    /// Locate the shard owning a key hash.
    pub fn locate_by_hash(&self, hash: u64) -> ShardId {
        self.shards
            .iter()
            .find(|s| hash >= s.hash_range_start && hash < s.hash_range_end)
            .or_else(|| self.shards.last())
            .map(|s| s.id)
            .unwrap_or(ShardId(0))
    }

    pub fn get_shard(&self, shard_id: ShardId) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.id == shard_id)
    }

    pub fn all_shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.id).collect()
    }

    pub fn num_shards(&self) -> u64 {
        self.shards.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_ranges_cover_hash_space() {
        let map = ShardMap::uniform(4);
        assert_eq!(map.num_shards(), 4);
        assert_eq!(map.locate_by_hash(0), ShardId(0));
        assert_eq!(map.locate_by_hash(u64::MAX), ShardId(3));
        assert_eq!(map.locate_by_hash(u64::MAX / 4 + 1), ShardId(1));
    }

    #[test]
    fn test_zero_shards_clamped() {
        let map = ShardMap::uniform(0);
        assert_eq!(map.shard_ids(), vec![ShardId(0)]);
    }
}
