//! Loader policy definitions.

pub mod v1;
pub mod frontier;

pub use v1::{LoaderPolicy, LoadingStrategy};
pub use frontier::{BoundedFrontier, ExpansionReason, FrontierCandidate, FrontierPolicy};
