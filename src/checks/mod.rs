//! Check contract and the built-in rule table.
//!
//! A [`Check`] is stateless: any per-run mutable state lives in a
//! [`CheckScratch`] owned by the runner for one (task, check) pair, so the
//! same rule instance can evaluate concurrent tasks safely. The runner calls
//! [`Check::reset`] once the check has seen every candidate.

pub mod registry;
pub mod orphan_edge;
pub mod one_member_relation;
pub mod duplicate_point;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::graph::AssembledGraph;
use crate::types::{Entity, EntityId, Flag, Location};

pub use registry::{CheckFactory, CheckRegistry};
pub use orphan_edge::OrphanEdgeCheck;
pub use one_member_relation::OneMemberRelationCheck;
pub use duplicate_point::{DuplicatePointFinder, DuplicatePointLocationCheck};

/// Error raised by a check while evaluating a candidate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckError {
    /// The candidate could not be evaluated.
    #[error("{check} failed on {candidate}: {message}")]
    Evaluation {
        /// Check name.
        check: String,
        /// Candidate description.
        candidate: String,
        /// Message.
        message: String,
    },
    /// The pool was killed before the candidate loop finished.
    #[error("{check} cancelled after the pool kill threshold")]
    Cancelled {
        /// Check name.
        check: String,
    },
    /// The check's settings are unusable.
    #[error("Invalid settings for {check}: {message}")]
    InvalidSettings {
        /// Check name.
        check: String,
        /// Message.
        message: String,
    },
}

/// Per-check settings shared by every rule.
///
/// When `countries` is non-empty it is an allow-list and takes precedence
/// over `except_countries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSettings {
    /// Whether the check loads at all.
    pub enabled: bool,
    /// Countries the check runs in; empty means all.
    pub countries: Vec<String>,
    /// Countries the check never runs in.
    pub except_countries: Vec<String>,
    /// Rule-specific options.
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            countries: Vec::new(),
            except_countries: Vec::new(),
            options: serde_json::Map::new(),
        }
    }
}

impl CheckSettings {
    /// Country filter for these settings.
    pub fn valid_for_country(&self, country: &str) -> bool {
        if !self.countries.is_empty() {
            return self.countries.iter().any(|c| c == country);
        }
        !self.except_countries.iter().any(|c| c == country)
    }

    /// Integer option, or `default` when absent.
    pub fn option_u64(&self, check: &str, key: &str, default: u64) -> Result<u64, CheckError> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| CheckError::InvalidSettings {
                check: check.to_string(),
                message: format!("option {} must be a non-negative integer, got {}", key, value),
            }),
        }
    }
}

/// Read-only inputs of one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    /// Country being checked.
    pub country: &'a str,
    /// Assembled graph of the task.
    pub graph: &'a AssembledGraph,
}

/// Higher-order entity computed by a check's finder (e.g. a cluster of points).
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexEntity {
    /// Short description, used in logs and flag identifiers.
    pub label: String,
    /// Constituent entity ids, sorted.
    pub members: Vec<EntityId>,
    /// Representative location, if any.
    pub location: Option<Location>,
}

impl ComplexEntity {
    /// Create a complex entity. Members are sorted and deduplicated.
    pub fn new(label: impl Into<String>, members: impl IntoIterator<Item = EntityId>) -> Self {
        let members: BTreeSet<EntityId> = members.into_iter().collect();
        Self {
            label: label.into(),
            members: members.into_iter().collect(),
            location: None,
        }
    }

    /// Builder-style location setter.
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

/// Computes a check's complex entities once per invocation.
pub trait ComplexFinder: Send + Sync {
    /// Find complex entities in the graph.
    fn find(&self, graph: &AssembledGraph) -> Vec<ComplexEntity>;
}

/// One thing a check evaluates.
#[derive(Debug, Clone, Copy)]
pub enum Candidate<'a> {
    /// A plain graph entity.
    Entity(&'a Entity),
    /// A complex entity from the check's finder.
    Complex(&'a ComplexEntity),
}

impl fmt::Display for Candidate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Entity(entity) => write!(f, "{}", entity.id),
            Candidate::Complex(complex) => write!(f, "{}", complex.label),
        }
    }
}

/// Mutable state of one check for one task.
#[derive(Debug, Default)]
pub struct CheckScratch {
    marked: BTreeSet<EntityId>,
}

impl CheckScratch {
    /// Mark an entity. Returns `true` if it was not marked before.
    pub fn mark(&mut self, id: EntityId) -> bool {
        self.marked.insert(id)
    }

    /// Whether an entity is marked.
    pub fn is_marked(&self, id: &EntityId) -> bool {
        self.marked.contains(id)
    }

    /// Number of marked entities.
    pub fn len(&self) -> usize {
        self.marked.len()
    }

    /// Whether nothing is marked.
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.marked.clear();
    }
}

/// A pluggable validation rule.
pub trait Check: Send + Sync {
    /// Unique check name; also the flag namespace.
    fn name(&self) -> &str;

    /// Whether the check runs for `country`.
    fn valid_for_country(&self, country: &str) -> bool;

    /// Finder for complex candidates, if the check uses one.
    fn finder(&self) -> Option<&dyn ComplexFinder> {
        None
    }

    /// Evaluate one candidate.
    fn evaluate(
        &self,
        ctx: &CheckContext<'_>,
        candidate: Candidate<'_>,
        scratch: &mut CheckScratch,
    ) -> Result<Option<Flag>, CheckError>;

    /// Clear per-check scratch state after the last candidate.
    fn reset(&self, scratch: &mut CheckScratch) {
        scratch.clear();
    }
}
