//! Frontier ordering and stop rules for deferred loading.

use std::cmp::Ordering;

use crate::types::{Distance, Shard};

/// Why a shard became a frontier candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExpansionReason {
    /// Within the buffer of a reached entity.
    Traversal,
    /// Touched by a reached relation.
    RelationClosure,
}

/// A shard waiting to be fetched by the deferred loader.
#[derive(Debug, Clone)]
pub struct FrontierCandidate {
    /// Shard to fetch.
    pub shard: Shard,
    /// Ring in which the shard was discovered (owned shards are ring 0).
    pub ring: u32,
    /// Gap between the shard and the owned shards' bounds.
    pub distance: Distance,
    /// Discovery reason.
    pub reason: ExpansionReason,
}

impl FrontierCandidate {
    /// Create a candidate.
    pub fn new(shard: Shard, ring: u32, distance: Distance, reason: ExpansionReason) -> Self {
        Self {
            shard,
            ring,
            distance,
            reason,
        }
    }
}

// Ordering for the frontier heap (max-heap pops the earliest ring first)
impl PartialEq for FrontierCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierCandidate {}

impl PartialOrd for FrontierCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Primary: lower ring first
        // Secondary: lower ShardId first for determinism
        other
            .ring
            .cmp(&self.ring)
            .then_with(|| other.shard.id.cmp(&self.shard.id))
    }
}

/// Injectable stop predicate for deferred expansion.
pub trait FrontierPolicy: Send + Sync {
    /// Whether another ring may be expanded after `ring`.
    fn continue_after(&self, ring: u32) -> bool;

    /// Whether a discovered candidate may be fetched.
    fn admit(&self, candidate: &FrontierCandidate) -> bool;
}

/// Frontier bounded by a ring count and a radius around the owned shards.
///
/// Relation-closure candidates ignore the radius when `relation_closure` is set.
#[derive(Debug, Clone, Copy)]
pub struct BoundedFrontier {
    /// Maximum ring.
    pub max_iterations: u32,
    /// Maximum gap from the owned shards.
    pub max_radius: Distance,
    /// Exempt relation-closure candidates from the radius cap.
    pub relation_closure: bool,
}

impl FrontierPolicy for BoundedFrontier {
    fn continue_after(&self, ring: u32) -> bool {
        ring < self.max_iterations
    }

    fn admit(&self, candidate: &FrontierCandidate) -> bool {
        if candidate.ring > self.max_iterations {
            return false;
        }
        if self.relation_closure && candidate.reason == ExpansionReason::RelationClosure {
            return true;
        }
        candidate.distance.as_meters() <= self.max_radius.as_meters()
    }
}
