//! Assembled graph: a read-only view over the fragments loaded for one task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::canonical::canonical_hash_hex;
use crate::types::{Entity, EntityId, EntityKind, GraphFragment, Rectangle, ShardGroup, ShardId};

/// Read-only composite over 1..N fragments.
///
/// Entities are deduplicated by id; when two fragments carry the same id the
/// fragment with the lower shard id wins. Fragments that could not be fetched
/// are recorded as holes.
#[derive(Debug, Clone)]
pub struct AssembledGraph {
    country: String,
    owned: BTreeSet<ShardId>,
    nominal_bounds: Rectangle,
    expanded_bounds: Rectangle,
    fragments: BTreeMap<ShardId, Arc<GraphFragment>>,
    holes: BTreeSet<ShardId>,
    index: BTreeMap<EntityId, ShardId>,
    node_edges: BTreeMap<EntityId, Vec<EntityId>>,
}

impl AssembledGraph {
    /// Assemble a graph from fetched fragments.
    ///
    /// `expanded_bounds` is the region the loader aimed to cover. It is widened
    /// to include every loaded shard's bounds.
    pub fn new(
        country: impl Into<String>,
        group: &ShardGroup,
        nominal_bounds: Rectangle,
        expanded_bounds: Rectangle,
        fragments: BTreeMap<ShardId, Arc<GraphFragment>>,
        holes: BTreeSet<ShardId>,
    ) -> Self {
        let mut index = BTreeMap::new();
        for (shard, fragment) in &fragments {
            for entity in fragment.entities() {
                index.entry(entity.id).or_insert(*shard);
            }
        }

        let mut node_edges: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        let edges = index
            .range(EntityId::new(EntityKind::Edge, i64::MIN)..=EntityId::new(EntityKind::Edge, i64::MAX))
            .filter_map(|(id, shard)| fragments.get(shard).and_then(|f| f.get(id)));
        for edge in edges {
            for node in edge.start.iter().chain(edge.end.iter()) {
                let at_node = node_edges.entry(*node).or_default();
                if !at_node.contains(&edge.id) {
                    at_node.push(edge.id);
                }
            }
        }

        let expanded_bounds = fragments
            .keys()
            .map(ShardId::bounds)
            .fold(expanded_bounds, |acc, b| acc.union(&b));

        Self {
            country: country.into(),
            owned: group.shard_ids(),
            nominal_bounds,
            expanded_bounds,
            fragments,
            holes,
            index,
            node_edges,
        }
    }

    /// Country.
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Look up an entity.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        let shard = self.index.get(id)?;
        self.fragments.get(shard)?.get(id)
    }

    /// Whether the entity is present.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    /// All entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.index
            .iter()
            .filter_map(|(id, shard)| self.fragments.get(shard).and_then(|f| f.get(id)))
    }

    /// Entities of one kind, in id order.
    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> + '_ {
        self.index
            .range(EntityId::new(kind, i64::MIN)..=EntityId::new(kind, i64::MAX))
            .filter_map(|(id, shard)| self.fragments.get(shard).and_then(|f| f.get(id)))
    }

    /// Whether the entity is stored in one of the task's own shards.
    ///
    /// Entities carried by several fragments (relations spanning a border)
    /// are owned by every task owning one of those fragments.
    pub fn owns(&self, id: &EntityId) -> bool {
        self.owned
            .iter()
            .filter_map(|shard| self.fragments.get(shard))
            .any(|fragment| fragment.get(id).is_some())
    }

    /// Entities stored in the task's own shards.
    pub fn owned_entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities().filter(|e| self.owns(&e.id))
    }

    /// Edges starting or ending at `node`.
    pub fn edges_at(&self, node: &EntityId) -> &[EntityId] {
        self.node_edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Other edges sharing an endpoint with `edge`.
    pub fn connected_edges(&self, edge: &Entity) -> Vec<&Entity> {
        let mut seen = BTreeSet::new();
        edge.start
            .iter()
            .chain(edge.end.iter())
            .flat_map(|node| self.edges_at(node).iter())
            .filter(|id| **id != edge.id && seen.insert(**id))
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Number of distinct entities.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the graph has no entities.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Owned shard ids.
    pub fn owned_shards(&self) -> &BTreeSet<ShardId> {
        &self.owned
    }

    /// Shards whose fragments are part of the view.
    pub fn loaded_shards(&self) -> impl Iterator<Item = &ShardId> + '_ {
        self.fragments.keys()
    }

    /// Shards the loader requested but could not fetch.
    pub fn missing_shards(&self) -> &BTreeSet<ShardId> {
        &self.holes
    }

    /// Bounds of the owned shards.
    pub fn nominal_bounds(&self) -> Rectangle {
        self.nominal_bounds
    }

    /// Bounds covered by the view.
    pub fn expanded_bounds(&self) -> Rectangle {
        self.expanded_bounds
    }

    /// Fingerprint over the loaded shards and entity ids.
    pub fn fingerprint(&self) -> String {
        let shards: Vec<String> = self.fragments.keys().map(ShardId::name).collect();
        let ids: Vec<String> = self.index.keys().map(EntityId::to_string).collect();
        canonical_hash_hex(&(shards, ids))
    }
}
