//! Per-shard graph fragments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entity::{Entity, EntityId, EntityKind};
use super::shard::ShardId;
use crate::canonical::canonical_hash_hex;

/// Immutable snapshot of the entities anchored in one shard.
///
/// Identity is the shard id. Entities iterate in `EntityId` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FragmentRecord", into = "FragmentRecord")]
pub struct GraphFragment {
    /// Country (ISO3) the fragment belongs to.
    pub country: String,
    /// Owning shard.
    pub shard: ShardId,
    entities: BTreeMap<EntityId, Entity>,
}

impl GraphFragment {
    /// Create a fragment from a list of entities. Later duplicates win.
    pub fn new(country: impl Into<String>, shard: ShardId, entities: Vec<Entity>) -> Self {
        Self {
            country: country.into(),
            shard,
            entities: entities.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    /// Start a builder.
    pub fn builder(country: impl Into<String>, shard: ShardId) -> GraphFragmentBuilder {
        GraphFragmentBuilder {
            country: country.into(),
            shard,
            entities: Vec::new(),
        }
    }

    /// Look up an entity.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// All entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities of one kind.
    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| e.id.kind == kind)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Content fingerprint (country, shard, entities).
    pub fn fingerprint(&self) -> String {
        canonical_hash_hex(self)
    }
}

/// Serialized form: entities as an id-ordered list.
#[derive(Clone, Serialize, Deserialize)]
struct FragmentRecord {
    country: String,
    shard: ShardId,
    entities: Vec<Entity>,
}

impl From<FragmentRecord> for GraphFragment {
    fn from(record: FragmentRecord) -> Self {
        GraphFragment::new(record.country, record.shard, record.entities)
    }
}

impl From<GraphFragment> for FragmentRecord {
    fn from(fragment: GraphFragment) -> Self {
        Self {
            country: fragment.country,
            shard: fragment.shard,
            entities: fragment.entities.into_values().collect(),
        }
    }
}

/// Builder for [`GraphFragment`].
#[derive(Debug)]
pub struct GraphFragmentBuilder {
    country: String,
    shard: ShardId,
    entities: Vec<Entity>,
}

impl GraphFragmentBuilder {
    /// Add an entity.
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Finish.
    pub fn build(self) -> GraphFragment {
        GraphFragment::new(self.country, self.shard, self.entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let shard = ShardId::new(10, 1, 1);
        let a = Entity::node(1, Location::new(0.0, 0.0));
        let b = Entity::node(2, Location::new(0.0, 0.1));

        let f1 = GraphFragment::new("XYZ", shard, vec![a.clone(), b.clone()]);
        let f2 = GraphFragment::new("XYZ", shard, vec![b, a]);
        assert_eq!(f1.fingerprint(), f2.fingerprint());
        assert_eq!(f1.len(), 2);
    }

    #[test]
    fn test_entities_of_kind() {
        let fragment = GraphFragment::builder("XYZ", ShardId::new(1, 0, 0))
            .entity(Entity::node(1, Location::new(0.0, 0.0)))
            .entity(Entity::point(1, Location::new(0.0, 0.0)))
            .build();
        assert_eq!(fragment.entities_of(EntityKind::Point).count(), 1);
        assert!(fragment.get(&EntityId::node(1)).is_some());
    }
}
