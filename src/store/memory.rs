//! In-memory fragment fetcher for tests and small runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{AtlasFetcher, FetchError};
use crate::types::{Entity, GraphFragment, Shard, ShardId};

/// In-memory fetcher keyed by `(country, shard)`.
///
/// Supports injected failures and latency so loader and cache behavior can
/// be exercised deterministically. Counts every fetch call.
#[derive(Debug, Default)]
pub struct InMemoryAtlasFetcher {
    fragments: BTreeMap<(String, ShardId), Arc<GraphFragment>>,
    failing: BTreeSet<(String, ShardId)>,
    latency: Option<Duration>,
    fetch_count: AtomicUsize,
}

impl InMemoryAtlasFetcher {
    /// Create an empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment, replacing any existing one for the same key.
    pub fn add_fragment(&mut self, fragment: GraphFragment) {
        let key = (fragment.country.clone(), fragment.shard);
        self.fragments.insert(key, Arc::new(fragment));
    }

    /// Distribute entities into fragments by the shard containing their anchor.
    ///
    /// Entities whose anchor lies in none of `shards` are dropped. On a shared
    /// border the lowest shard id wins.
    pub fn add_entities(&mut self, country: &str, shards: &[Shard], entities: Vec<Entity>) {
        let mut by_shard: BTreeMap<ShardId, Vec<Entity>> = BTreeMap::new();
        let mut ordered: Vec<&Shard> = shards.iter().collect();
        ordered.sort_by_key(|s| s.id);
        for entity in entities {
            let Some(anchor) = entity.anchor() else {
                continue;
            };
            if let Some(shard) = ordered.iter().find(|s| s.bounds.contains(&anchor)) {
                by_shard.entry(shard.id).or_default().push(entity);
            }
        }
        for shard in shards {
            let entities = by_shard.remove(&shard.id).unwrap_or_default();
            self.add_fragment(GraphFragment::new(country, shard.id, entities));
        }
    }

    /// Make fetches of `(country, shard)` fail.
    pub fn fail_on(&mut self, country: &str, shard: ShardId) {
        self.failing.insert((country.to_string(), shard));
    }

    /// Delay every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of fetch calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Shards with data for a country.
    pub fn shards_for(&self, country: &str) -> Vec<ShardId> {
        self.fragments
            .keys()
            .filter(|(c, _)| c == country)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Countries with at least one fragment.
    pub fn countries(&self) -> BTreeSet<String> {
        self.fragments.keys().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl AtlasFetcher for InMemoryAtlasFetcher {
    async fn fetch(
        &self,
        country: &str,
        shard: &ShardId,
    ) -> Result<Option<Arc<GraphFragment>>, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let key = (country.to_string(), *shard);
        if self.failing.contains(&key) {
            return Err(FetchError::Backend {
                country: country.to_string(),
                shard: *shard,
                message: "injected failure".to_string(),
            });
        }
        Ok(self.fragments.get(&key).cloned())
    }
}
