//! # sharded-checks
//!
//! Sharded, boundary-aware execution of integrity checks over a road
//! network graph.
//!
//! The engine answers one question:
//!
//! > Given a country split into shards, how do we run every check on every
//! > shard in parallel and still report each issue exactly once?
//!
//! ## Core Contract
//!
//! 1. Partition each country's shards into tasks (one shard, or a bounded group)
//! 2. Assemble each task's graph from its own shards plus a buffer ring, so
//!    features crossing the boundary are seen whole
//! 3. Run all of the country's checks concurrently over that graph
//! 4. Deduplicate flags by identity and fold every task's result into one
//!    per-country container
//!
//! ## Architecture
//!
//! ```text
//! TaskScheduler → BoundaryAwareGraphLoader → CheckRunner → EventStream
//!       ↑                  ↓                                   ↓
//!   ShardGrouper      AtlasFetcher (cache)       FlagCollector / sinks
//!                                                         ↓
//!                                          FlagContainer::combine per country
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same shards + same policy + same fragments → identical assembled graph
//! - `combine` is associative and commutative, so task completion order
//!   never changes the merged result
//! - Duplicate flags keep a canonical representative, independent of which
//!   shard reported it first

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod canonical;
pub mod sharding;
pub mod store;
pub mod policy;
pub mod graph;
pub mod loader;
pub mod checks;
pub mod events;
pub mod aggregator;
pub mod runner;
pub mod scheduler;
pub mod sinks;
pub mod config;
pub mod job;

// Re-exports
pub use types::{
    Distance, Entity, EntityId, EntityKind, Flag, FlagIdentity, FlaggedObject, GraphFragment,
    Location, Rectangle, Shard, ShardGroup, ShardId, Task, TaskKey,
};
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};
pub use sharding::{AvailableShards, ShardingIndex};
pub use store::{
    AtlasFetcher, CacheConfig, CacheStats, CachingFetcher, DirectoryAtlasFetcher, FetchError,
    InMemoryAtlasFetcher,
};
pub use policy::{BoundedFrontier, FrontierPolicy, LoaderPolicy, LoadingStrategy};
pub use graph::AssembledGraph;
pub use loader::{BoundaryAwareGraphLoader, LoaderError};
pub use checks::{Candidate, Check, CheckContext, CheckError, CheckRegistry, CheckScratch, CheckSettings};
pub use events::{CheckEvent, EventStream, Processor};
pub use aggregator::{FlagCollector, FlagContainer};
pub use runner::{CandidateFilter, CheckOutcome, CheckRunner, RunSummary, TicketClient};
pub use scheduler::{GroupingMode, SchedulerError, ShardGrouper, TaskScheduler};
pub use sinks::{FlagFileProcessor, MetricFileProcessor, OutputLayout, SinkError};
pub use config::{CheckSettingsOverride, ChecksConfig, JobConfig, OutputFormat};
pub use job::{CheckJob, JobError, JobReport};

/// Schema version of fragments, flags, events and job reports.
/// Increment on breaking changes to any serialized type.
pub const SHARDED_CHECKS_SCHEMA_VERSION: &str = "1.0.0";

/// Default loader policy version identifier.
pub const DEFAULT_LOADER_POLICY_VERSION: &str = "loader_policy_v1";
