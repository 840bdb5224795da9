//! Core types for the sharded check engine.

pub mod geometry;
pub mod shard;
pub mod entity;
pub mod fragment;
pub mod flag;
pub mod task;

pub use geometry::{Distance, Location, Rectangle};
pub use shard::{Shard, ShardGroup, ShardId, ShardNameError};
pub use entity::{Entity, EntityId, EntityKind};
pub use fragment::{GraphFragment, GraphFragmentBuilder};
pub use flag::{Flag, FlagIdentity, FlaggedObject};
pub use task::{Task, TaskKey};
