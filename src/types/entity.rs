//! Graph entities: the features stored in a fragment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::geometry::{Location, Rectangle};

/// Kind of graph entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Junction vertex joining edges.
    Node,
    /// Stand-alone point feature.
    Point,
    /// Directed, routable edge.
    Edge,
    /// Non-routable line.
    Line,
    /// Closed area.
    Area,
    /// Relation grouping other entities.
    Relation,
}

impl EntityKind {
    /// Short prefix used in identifiers.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Node => "N",
            Self::Point => "P",
            Self::Edge => "E",
            Self::Line => "L",
            Self::Area => "A",
            Self::Relation => "R",
        }
    }

    /// Parse a prefix.
    pub fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "N" => Some(Self::Node),
            "P" => Some(Self::Point),
            "E" => Some(Self::Edge),
            "L" => Some(Self::Line),
            "A" => Some(Self::Area),
            "R" => Some(Self::Relation),
            _ => None,
        }
    }
}

/// Identifier of an entity, unique across the whole network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// Entity kind.
    pub kind: EntityKind,
    /// Numeric identifier.
    pub id: i64,
}

impl EntityId {
    /// Create a new id.
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    /// Node id shorthand.
    pub fn node(id: i64) -> Self {
        Self::new(EntityKind::Node, id)
    }

    /// Edge id shorthand.
    pub fn edge(id: i64) -> Self {
        Self::new(EntityKind::Edge, id)
    }

    /// Relation id shorthand.
    pub fn relation(id: i64) -> Self {
        Self::new(EntityKind::Relation, id)
    }

    /// Point id shorthand.
    pub fn point(id: i64) -> Self {
        Self::new(EntityKind::Point, id)
    }

    /// Parse `E123`-style identifiers.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || !s.is_char_boundary(1) {
            return None;
        }
        let (prefix, rest) = s.split_at(1);
        Some(Self::new(EntityKind::from_prefix(prefix)?, rest.parse().ok()?))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

/// A feature of the network.
///
/// Edges reference their endpoint nodes; relations reference members.
/// The first location is the entity's anchor and decides which shard stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier.
    pub id: EntityId,
    /// Geometry; a single location for nodes and points.
    pub geometry: Vec<Location>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Start node (edges only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EntityId>,
    /// End node (edges only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EntityId>,
    /// Members (relations only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<EntityId>,
}

impl Entity {
    /// Create a node.
    pub fn node(id: i64, location: Location) -> Self {
        Self::bare(EntityId::node(id), vec![location])
    }

    /// Create a point.
    pub fn point(id: i64, location: Location) -> Self {
        Self::bare(EntityId::point(id), vec![location])
    }

    /// Create an edge between two nodes.
    pub fn edge(id: i64, start: EntityId, end: EntityId, geometry: Vec<Location>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::bare(EntityId::edge(id), geometry)
        }
    }

    /// Create a relation; `geometry` should cover the members.
    pub fn relation(id: i64, members: Vec<EntityId>, geometry: Vec<Location>) -> Self {
        Self {
            members,
            ..Self::bare(EntityId::relation(id), geometry)
        }
    }

    fn bare(id: EntityId, geometry: Vec<Location>) -> Self {
        Self {
            id,
            geometry,
            tags: BTreeMap::new(),
            start: None,
            end: None,
            members: Vec::new(),
        }
    }

    /// Builder-style tag setter.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Anchor location (first geometry point).
    pub fn anchor(&self) -> Option<Location> {
        self.geometry.first().copied()
    }

    /// Bounding box of the geometry.
    pub fn bounds(&self) -> Option<Rectangle> {
        Rectangle::covering(&self.geometry)
    }

    /// Entities this one points at (endpoints and members).
    pub fn references(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.start
            .iter()
            .chain(self.end.iter())
            .chain(self.members.iter())
            .copied()
    }

    /// Tag lookup.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_parse() {
        let id = EntityId::edge(42);
        assert_eq!(id.to_string(), "E42");
        assert_eq!(EntityId::parse("E42"), Some(id));
        assert_eq!(EntityId::parse("X1"), None);
        assert_eq!(EntityId::parse(""), None);
    }

    #[test]
    fn test_edge_references() {
        let edge = Entity::edge(
            1,
            EntityId::node(10),
            EntityId::node(11),
            vec![Location::new(0.0, 0.0), Location::new(0.0, 1.0)],
        );
        let refs: Vec<_> = edge.references().collect();
        assert_eq!(refs, vec![EntityId::node(10), EntityId::node(11)]);
        assert_eq!(edge.anchor(), Some(Location::new(0.0, 0.0)));
    }
}
