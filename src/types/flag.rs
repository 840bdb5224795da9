//! Flags: issues reported by a check against one or more features.
//!
//! ## Identity
//!
//! Two flags are duplicates when they share a [`FlagIdentity`]: the check
//! name plus the set of flagged feature ids. Geometry, instructions and the
//! producing shard are not part of identity, so the same issue seen from
//! two neighboring shards collapses into one flag.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::entity::{Entity, EntityId};
use super::geometry::{Location, Rectangle};
use crate::canonical::{canonical_hash_hex, to_canonical_bytes};

/// A feature referenced by a flag, with the geometry it had when flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedObject {
    /// Feature id.
    pub id: EntityId,
    /// Geometry snapshot.
    pub geometry: Vec<Location>,
}

impl FlaggedObject {
    /// Snapshot an entity.
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            geometry: entity.geometry.clone(),
        }
    }
}

/// Output of one check on one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    /// Name of the producing check.
    pub check_name: String,
    /// Check-specific identifier (usually derived from the flagged ids).
    pub identifier: String,
    /// Human readable instructions, in order.
    pub instructions: Vec<String>,
    /// Flagged features.
    pub objects: Vec<FlaggedObject>,
    /// Additional highlighted locations.
    pub points: Vec<Location>,
}

/// Content identity of a flag: check name + flagged feature ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlagIdentity {
    /// Producing check.
    pub check_name: String,
    /// Sorted feature ids (or the flag identifier when no features are attached).
    pub feature_ids: BTreeSet<String>,
}

impl std::fmt::Display for FlagIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.feature_ids.iter().map(String::as_str).collect();
        write!(f, "{}[{}]", self.check_name, ids.join(","))
    }
}

impl Flag {
    /// Create an empty flag.
    pub fn new(check_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            check_name: check_name.into(),
            identifier: identifier.into(),
            instructions: Vec::new(),
            objects: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Attach a feature.
    pub fn with_object(mut self, entity: &Entity) -> Self {
        self.objects.push(FlaggedObject::from_entity(entity));
        self
    }

    /// Attach several features.
    pub fn with_objects<'a, I>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        self.objects.extend(entities.into_iter().map(FlaggedObject::from_entity));
        self
    }

    /// Append an instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }

    /// Highlight a location.
    pub fn with_point(mut self, point: Location) -> Self {
        self.points.push(point);
        self
    }

    /// Ids of the flagged features.
    pub fn feature_ids(&self) -> BTreeSet<EntityId> {
        self.objects.iter().map(|o| o.id).collect()
    }

    /// Deduplication identity.
    pub fn identity(&self) -> FlagIdentity {
        let mut feature_ids: BTreeSet<String> =
            self.objects.iter().map(|o| o.id.to_string()).collect();
        if feature_ids.is_empty() {
            feature_ids.insert(self.identifier.clone());
        }
        FlagIdentity {
            check_name: self.check_name.clone(),
            feature_ids,
        }
    }

    /// Detached, normalized form.
    ///
    /// Objects are sorted and deduplicated by id, coordinates snapped to the
    /// 1e-7 degree grid, and points sorted and deduplicated. Flags produced
    /// from different fragments for the same features compare equal in this form.
    pub fn complete(&self) -> Flag {
        let mut objects: Vec<FlaggedObject> = self
            .objects
            .iter()
            .map(|o| FlaggedObject {
                id: o.id,
                geometry: o.geometry.iter().map(Location::quantized).collect(),
            })
            .collect();
        objects.sort_by_key(|o| o.id);
        objects.dedup_by_key(|o| o.id);

        let mut points: Vec<Location> = self.points.iter().map(Location::quantized).collect();
        points.sort_by_key(Location::grid_key);
        points.dedup_by_key(|p| p.grid_key());

        Flag {
            check_name: self.check_name.clone(),
            identifier: self.identifier.clone(),
            instructions: self.instructions.clone(),
            objects,
            points,
        }
    }

    /// Total order over flag content, used to pick a deterministic
    /// representative among duplicates.
    pub fn content_cmp(&self, other: &Flag) -> Ordering {
        to_canonical_bytes(self).cmp(&to_canonical_bytes(other))
    }

    /// Fingerprint of the complete form.
    pub fn fingerprint(&self) -> String {
        canonical_hash_hex(&self.complete())
    }

    /// Bounds of every flagged geometry and point.
    pub fn bounds(&self) -> Option<Rectangle> {
        Rectangle::covering(
            self.objects
                .iter()
                .flat_map(|o| o.geometry.iter())
                .chain(self.points.iter()),
        )
    }
}
