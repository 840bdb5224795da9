//! LoaderPolicy v1: strategy, buffer distance and frontier caps.
//!
//! ## Float Normalization for Deterministic Hashing
//!
//! Distances are quantized to whole millimeters before hashing, so two
//! configurations that differ only by float noise share a `params_hash`.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::types::Distance;
use crate::DEFAULT_LOADER_POLICY_VERSION;

/// Quantization factor: meters to millimeters.
const DISTANCE_QUANTIZATION_FACTOR: f64 = 1_000.0;

/// How the loader assembles the graph for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LoadingStrategy {
    /// Fetch every shard intersecting the buffered group bounds up front.
    Eager,
    /// Start from the owned shards and pull neighbors as traversal reaches them.
    Deferred {
        /// Also pull every shard touched by a reached relation, transitively.
        #[serde(default)]
        relation_aware: bool,
    },
}

impl Default for LoadingStrategy {
    fn default() -> Self {
        Self::Eager
    }
}

impl std::fmt::Display for LoadingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eager => write!(f, "eager"),
            Self::Deferred { relation_aware: false } => write!(f, "deferred"),
            Self::Deferred { relation_aware: true } => write!(f, "deferred+relations"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct QuantizedLoaderParams {
    version: String,
    strategy: LoadingStrategy,
    buffer_mm: i64,
    max_iterations: u32,
    max_radius_mm: i64,
}

fn quantize_distance(distance: Distance) -> i64 {
    (distance.as_meters() * DISTANCE_QUANTIZATION_FACTOR).round() as i64
}

/// Loader policy version 1.
///
/// ## Parameters
///
/// - `strategy`: eager union or deferred frontier expansion
/// - `buffer_distance`: boundary expansion distance around owned shards
/// - `max_iterations`: deferred mode ring cap (ring 0 is the owned shards)
/// - `max_radius`: deferred mode cap on how far from the owned shards a
///   pulled shard may lie; never smaller than `buffer_distance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderPolicy {
    /// Policy version identifier.
    pub version: String,
    /// Assembly strategy.
    pub strategy: LoadingStrategy,
    /// Boundary expansion distance.
    pub buffer_distance: Distance,
    /// Maximum frontier rings after the owned shards.
    pub max_iterations: u32,
    /// Maximum distance of a pulled shard from the owned shards.
    pub max_radius: Distance,
}

impl LoaderPolicy {
    /// Eager policy with the given buffer.
    pub fn eager(buffer_distance: Distance) -> Self {
        Self {
            strategy: LoadingStrategy::Eager,
            buffer_distance,
            ..Self::default()
        }
    }

    /// Deferred policy with the given buffer.
    pub fn deferred(buffer_distance: Distance, relation_aware: bool) -> Self {
        Self {
            strategy: LoadingStrategy::Deferred { relation_aware },
            buffer_distance,
            ..Self::default()
        }
    }

    /// Get the policy ID.
    pub fn policy_id(&self) -> &str {
        &self.version
    }

    /// Radius cap actually applied by the frontier.
    pub fn effective_radius(&self) -> Distance {
        if self.max_radius.as_meters() < self.buffer_distance.as_meters() {
            self.buffer_distance
        } else {
            self.max_radius
        }
    }

    /// Compute a hash of the policy parameters.
    pub fn params_hash(&self) -> String {
        canonical_hash_hex(&self.to_quantized())
    }

    fn to_quantized(&self) -> QuantizedLoaderParams {
        QuantizedLoaderParams {
            version: self.version.clone(),
            strategy: self.strategy,
            buffer_mm: quantize_distance(self.buffer_distance),
            max_iterations: self.max_iterations,
            max_radius_mm: quantize_distance(self.effective_radius()),
        }
    }
}

impl Default for LoaderPolicy {
    fn default() -> Self {
        Self {
            version: DEFAULT_LOADER_POLICY_VERSION.to_string(),
            strategy: LoadingStrategy::Eager,
            buffer_distance: Distance::kilometers(10.0),
            max_iterations: 8,
            max_radius: Distance::kilometers(50.0),
        }
    }
}
