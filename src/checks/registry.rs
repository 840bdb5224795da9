//! Lookup table of the rules this build knows about.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    Check, CheckError, CheckSettings, DuplicatePointLocationCheck, OneMemberRelationCheck,
    OrphanEdgeCheck,
};
use crate::config::ChecksConfig;

/// Constructor of a rule from its settings.
pub type CheckFactory = fn(CheckSettings) -> Result<Arc<dyn Check>, CheckError>;

/// Explicit name → constructor table.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    factories: BTreeMap<String, CheckFactory>,
}

impl CheckRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in rules.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(OrphanEdgeCheck::NAME, orphan_edge);
        registry.register(OneMemberRelationCheck::NAME, one_member_relation);
        registry.register(DuplicatePointLocationCheck::NAME, duplicate_point_location);
        registry
    }

    /// Register (or replace) a rule.
    pub fn register(&mut self, name: impl Into<String>, factory: CheckFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the checks that run for `country`, in name order.
    ///
    /// Skips rules outside a non-empty permit-list or on the deny-list,
    /// disabled rules, and rules whose country filter rejects `country`.
    /// Settings include the country and country-group overrides. A rule that
    /// fails to build is logged and skipped.
    pub fn load_for_country(&self, config: &ChecksConfig, country: &str) -> Vec<Arc<dyn Check>> {
        let mut loaded = Vec::new();
        for (name, factory) in &self.factories {
            if !config.is_listed(name) {
                continue;
            }
            let settings = config.settings_for(name, country);
            if !settings.enabled {
                continue;
            }
            match factory(settings) {
                Ok(check) if check.valid_for_country(country) => loaded.push(check),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(country, check = %name, error = %error, "Could not load check");
                }
            }
        }
        loaded
    }

    /// Checks for every country; countries without checks map to an empty list.
    pub fn load_for_countries(
        &self,
        config: &ChecksConfig,
        countries: &[String],
    ) -> BTreeMap<String, Vec<Arc<dyn Check>>> {
        countries
            .iter()
            .map(|country| (country.clone(), self.load_for_country(config, country)))
            .collect()
    }
}

fn orphan_edge(settings: CheckSettings) -> Result<Arc<dyn Check>, CheckError> {
    Ok(Arc::new(OrphanEdgeCheck::new(settings)))
}

fn one_member_relation(settings: CheckSettings) -> Result<Arc<dyn Check>, CheckError> {
    Ok(Arc::new(OneMemberRelationCheck::new(settings)))
}

fn duplicate_point_location(settings: CheckSettings) -> Result<Arc<dyn Check>, CheckError> {
    Ok(Arc::new(DuplicatePointLocationCheck::new(settings)?))
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
