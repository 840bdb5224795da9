//! Units of work: one country × one shard group.

use std::fmt;
use std::sync::Arc;

use super::shard::ShardGroup;
use crate::checks::Check;

/// Key of a task: country + shard group name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    /// Country ISO3 code.
    pub country: String,
    /// Shard group name.
    pub group: String,
}

impl fmt::Display for TaskKey {
    /// Event stream name: `country_group`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.country, self.group)
    }
}

/// A scheduled unit of work. Created once per scheduling pass, consumed once.
#[derive(Clone)]
pub struct Task {
    country: String,
    group: ShardGroup,
    checks: Vec<Arc<dyn Check>>,
}

impl Task {
    /// Create a task.
    pub fn new(country: impl Into<String>, group: ShardGroup, checks: Vec<Arc<dyn Check>>) -> Self {
        Self {
            country: country.into(),
            group,
            checks,
        }
    }

    /// Country.
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Owned shard group.
    pub fn group(&self) -> &ShardGroup {
        &self.group
    }

    /// Checks to run, in registration order.
    pub fn checks(&self) -> &[Arc<dyn Check>] {
        &self.checks
    }

    /// Task key.
    pub fn key(&self) -> TaskKey {
        TaskKey {
            country: self.country.clone(),
            group: self.group.name().to_string(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.checks.iter().map(|c| c.name()).collect();
        f.debug_struct("Task")
            .field("country", &self.country)
            .field("group", &self.group.name())
            .field("shards", &self.group.len())
            .field("checks", &names)
            .finish()
    }
}
