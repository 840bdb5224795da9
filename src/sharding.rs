//! Sharding index: which shards cover a region.

use std::collections::BTreeMap;

use crate::types::{Distance, Rectangle, Shard, ShardId};

/// Spatial lookup over a set of shards.
///
/// Implementations must return shards ordered by `ShardId` so that
/// loaders iterate deterministically.
pub trait ShardingIndex: Send + Sync {
    /// Shards whose bounds overlap `bounds`.
    fn shards_intersecting(&self, bounds: &Rectangle) -> Vec<Shard>;

    /// Look up a shard by id.
    fn shard(&self, id: &ShardId) -> Option<Shard>;
}

/// Sharding restricted to the shards actually available for a run.
///
/// Requests for regions outside the available set simply return fewer
/// shards; missing tiles are holes, not errors.
#[derive(Debug, Clone, Default)]
pub struct AvailableShards {
    shards: BTreeMap<ShardId, Shard>,
}

impl AvailableShards {
    /// Build from any collection of shards. Duplicates collapse.
    pub fn new<I: IntoIterator<Item = Shard>>(shards: I) -> Self {
        Self {
            shards: shards.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    /// Build from slippy tile ids.
    pub fn from_ids<I: IntoIterator<Item = ShardId>>(ids: I) -> Self {
        Self::new(ids.into_iter().map(Shard::from_id))
    }

    /// Shards sharing a border (or corner) with `shard`, excluding itself.
    pub fn neighbors(&self, shard: &Shard) -> Vec<Shard> {
        if !self.shards.contains_key(&shard.id) {
            return Vec::new();
        }
        self.shards_intersecting(&shard.bounds.expand(Distance::meters(1.0)))
            .into_iter()
            .filter(|s| s.id != shard.id)
            .collect()
    }

    /// All shards in id order.
    pub fn all(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether no shards are available.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl ShardingIndex for AvailableShards {
    fn shards_intersecting(&self, bounds: &Rectangle) -> Vec<Shard> {
        self.shards
            .values()
            .filter(|s| s.bounds.overlaps(bounds))
            .copied()
            .collect()
    }

    fn shard(&self, id: &ShardId) -> Option<Shard> {
        self.shards.get(id).copied()
    }
}
