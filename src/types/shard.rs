//! Shard types: fixed slippy-tile partitions of the globe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fmt;

use super::geometry::{Location, Rectangle};

/// Identifier of a slippy tile (`zoom-x-y`).
///
/// Ordered by (zoom, x, y) so shard sets iterate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Zoom level.
    pub zoom: u8,
    /// Column.
    pub x: u32,
    /// Row (grows southward).
    pub y: u32,
}

/// Error parsing a shard name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid shard name: {0}")]
pub struct ShardNameError(pub String);

impl ShardId {
    /// Create a new shard id.
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Parse a `zoom-x-y` name.
    pub fn parse(name: &str) -> Result<Self, ShardNameError> {
        let parts: Vec<&str> = name.trim().split('-').collect();
        if parts.len() != 3 {
            return Err(ShardNameError(name.to_string()));
        }
        let err = || ShardNameError(name.to_string());
        let zoom: u8 = parts[0].parse().map_err(|_| err())?;
        let x: u32 = parts[1].parse().map_err(|_| err())?;
        let y: u32 = parts[2].parse().map_err(|_| err())?;
        if zoom > 30 || u64::from(x) >= (1u64 << zoom) || u64::from(y) >= (1u64 << zoom) {
            return Err(err());
        }
        Ok(Self { zoom, x, y })
    }

    /// Canonical name.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Geographic bounds of the tile.
    pub fn bounds(&self) -> Rectangle {
        let n = (1u64 << self.zoom) as f64;
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
        Rectangle::new(
            Location::new(lat(f64::from(self.y) + 1.0), lon(f64::from(self.x))),
            Location::new(lat(f64::from(self.y)), lon(f64::from(self.x) + 1.0)),
        )
    }

    /// The four tiles one zoom level down.
    pub fn children(&self) -> [ShardId; 4] {
        let (z, x, y) = (self.zoom + 1, self.x * 2, self.y * 2);
        [
            ShardId::new(z, x, y),
            ShardId::new(z, x + 1, y),
            ShardId::new(z, x, y + 1),
            ShardId::new(z, x + 1, y + 1),
        ]
    }

    /// The tile at `zoom` covering this one; `None` when `zoom` is finer.
    pub fn ancestor(&self, zoom: u8) -> Option<ShardId> {
        let shift = self.zoom.checked_sub(zoom)?;
        Some(ShardId::new(zoom, self.x >> shift, self.y >> shift))
    }

    /// Whether this tile fully covers `other` (same or coarser zoom).
    pub fn encloses(&self, other: &ShardId) -> bool {
        if other.zoom < self.zoom {
            return false;
        }
        let shift = other.zoom - self.zoom;
        other.x >> shift == self.x && other.y >> shift == self.y
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.zoom, self.x, self.y)
    }
}

/// A shard: tile id plus bounding geometry. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    /// Tile identifier.
    pub id: ShardId,
    /// Tile bounds.
    pub bounds: Rectangle,
}

impl Shard {
    /// Create a shard from a slippy tile id.
    pub fn from_id(id: ShardId) -> Self {
        Self { id, bounds: id.bounds() }
    }

    /// Create a shard with explicit bounds (non slippy-tile shardings).
    pub fn with_bounds(id: ShardId, bounds: Rectangle) -> Self {
        Self { id, bounds }
    }

    /// Canonical name.
    pub fn name(&self) -> String {
        self.id.name()
    }
}

/// A named set of shards owned by one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardGroup {
    name: String,
    shards: Vec<Shard>,
}

impl ShardGroup {
    /// Create a group. Shards are sorted by id and deduplicated.
    pub fn new(name: impl Into<String>, mut shards: Vec<Shard>) -> Self {
        shards.sort_by_key(|s| s.id);
        shards.dedup_by_key(|s| s.id);
        Self {
            name: name.into(),
            shards,
        }
    }

    /// Single-shard group named after the shard.
    pub fn single(shard: Shard) -> Self {
        Self::new(shard.name(), vec![shard])
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owned shards, ordered by id.
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Owned shard ids.
    pub fn shard_ids(&self) -> BTreeSet<ShardId> {
        self.shards.iter().map(|s| s.id).collect()
    }

    /// Union of the owned shards' bounds.
    pub fn bounds(&self) -> Option<Rectangle> {
        Rectangle::covering_all(self.shards.iter().map(|s| &s.bounds))
    }

    /// Number of owned shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the group owns no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_name() {
        let id = ShardId::parse("9-168-233").unwrap();
        assert_eq!(id, ShardId::new(9, 168, 233));
        assert_eq!(id.name(), "9-168-233");
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(ShardId::parse("2-4-0").is_err());
        assert!(ShardId::parse("abc").is_err());
        assert!(ShardId::parse("1-0").is_err());
    }

    #[test]
    fn test_zoom_zero_covers_world() {
        let bounds = ShardId::new(0, 0, 0).bounds();
        assert!((bounds.lower_left.lon + 180.0).abs() < 1e-9);
        assert!((bounds.upper_right.lon - 180.0).abs() < 1e-9);
        assert!(bounds.upper_right.lat > 85.0);
    }

    #[test]
    fn test_ancestor() {
        let id = ShardId::new(10, 513, 511);
        assert_eq!(id.ancestor(0), Some(ShardId::new(0, 0, 0)));
        assert_eq!(id.ancestor(9), Some(ShardId::new(9, 256, 255)));
        assert_eq!(id.ancestor(10), Some(id));
        assert_eq!(id.ancestor(11), None);
        assert!(id.ancestor(4).unwrap().encloses(&id));
    }

    #[test]
    fn test_children_enclosed() {
        let parent = ShardId::new(3, 2, 5);
        for child in parent.children() {
            assert!(parent.encloses(&child));
            assert!(parent.bounds().overlaps(&child.bounds()));
        }
        assert!(!parent.encloses(&ShardId::new(4, 0, 0)));
    }

    #[test]
    fn test_neighbors_share_edge() {
        let a = Shard::from_id(ShardId::new(10, 500, 400));
        let b = Shard::from_id(ShardId::new(10, 501, 400));
        assert!((a.bounds.upper_right.lon - b.bounds.lower_left.lon).abs() < 1e-9);
        assert!(a.bounds.overlaps(&b.bounds));
    }

    #[test]
    fn test_group_sorted_and_deduped() {
        let s1 = Shard::from_id(ShardId::new(4, 1, 1));
        let s2 = Shard::from_id(ShardId::new(4, 0, 1));
        let group = ShardGroup::new("g", vec![s1, s2, s1]);
        assert_eq!(group.len(), 2);
        assert_eq!(group.shards()[0].id, s2.id);
    }
}
