//! Flag aggregation and cross-shard merge.
//!
//! ## Combine Laws
//!
//! A [`FlagContainer`] maps check name → flag identity → flag (complete
//! form). When two containers hold the same identity, [`FlagContainer::combine`]
//! keeps the flag that sorts first by canonical content. Picking the
//! representative by content rather than by arrival makes combine
//! commutative and associative, so a country's shards can be folded in any
//! grouping or order and produce the same container.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::canonical::set_fingerprint;
use crate::events::{CheckEvent, Processor};
use crate::types::{Flag, FlagIdentity};

/// Deduplicated flags of one country (or one task).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagContainer {
    flags: BTreeMap<String, BTreeMap<FlagIdentity, Flag>>,
}

impl FlagContainer {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flag under `check_name`. Returns `true` if the identity was new.
    pub fn add(&mut self, check_name: &str, flag: &Flag) -> bool {
        let flag = flag.complete();
        let identity = flag.identity();
        let slot = self.flags.entry(check_name.to_string()).or_default();
        match slot.get_mut(&identity) {
            Some(existing) => {
                if flag.content_cmp(existing) == Ordering::Less {
                    *existing = flag;
                }
                false
            }
            None => {
                slot.insert(identity, flag);
                true
            }
        }
    }

    /// Add every flag of an iterator.
    pub fn add_all<'a, I>(&mut self, flags: I)
    where
        I: IntoIterator<Item = &'a Flag>,
    {
        for flag in flags {
            self.add(&flag.check_name, flag);
        }
    }

    /// Merge two containers.
    pub fn combine(mut self, other: FlagContainer) -> FlagContainer {
        self.merge(other);
        self
    }

    /// Merge `other` into `self`.
    pub fn merge(&mut self, other: FlagContainer) {
        for (check_name, flags) in other.flags {
            let slot = self.flags.entry(check_name).or_default();
            for (identity, flag) in flags {
                match slot.get_mut(&identity) {
                    Some(existing) => {
                        if flag.content_cmp(existing) == Ordering::Less {
                            *existing = flag;
                        }
                    }
                    None => {
                        slot.insert(identity, flag);
                    }
                }
            }
        }
    }

    /// Deduplicated flags as `FlagProduced` events, in (check, identity) order.
    pub fn reconstruct_events(&self) -> impl Iterator<Item = CheckEvent> + '_ {
        self.flags.values().flat_map(|flags| flags.values().cloned().map(CheckEvent::flag))
    }

    /// Flags of one check.
    pub fn flags_for(&self, check_name: &str) -> impl Iterator<Item = &Flag> + '_ {
        self.flags
            .get(check_name)
            .into_iter()
            .flat_map(|flags| flags.values())
    }

    /// Names of checks with at least one flag.
    pub fn check_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.flags
            .iter()
            .filter(|(_, flags)| !flags.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Flag count per check.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.flags
            .iter()
            .map(|(name, flags)| (name.clone(), flags.len()))
            .collect()
    }

    /// Total number of flags.
    pub fn len(&self) -> usize {
        self.flags.values().map(BTreeMap::len).sum()
    }

    /// Whether the container holds no flags.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order-insensitive fingerprint of the contents.
    pub fn fingerprint(&self) -> String {
        set_fingerprint(
            self.flags
                .values()
                .flat_map(|flags| flags.values())
                .map(Flag::fingerprint),
        )
    }
}

/// Processor collecting a task's flags into a container.
#[derive(Debug, Default)]
pub struct FlagCollector {
    container: Mutex<FlagContainer>,
}

impl FlagCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the collected flags, leaving the collector empty.
    pub fn take(&self) -> FlagContainer {
        std::mem::take(&mut *self.container.lock())
    }

    /// Number of distinct flags collected so far.
    pub fn len(&self) -> usize {
        self.container.lock().len()
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Processor for FlagCollector {
    fn process(&self, event: &CheckEvent) {
        if let CheckEvent::FlagProduced { check_name, flag } = event {
            self.container.lock().add(check_name, flag);
        }
    }
}
