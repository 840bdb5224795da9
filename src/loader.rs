//! Boundary-aware graph loader.
//!
//! Assembles the working graph for one task. Two interchangeable strategies:
//!
//! - **Eager**: fetch every shard intersecting the group bounds expanded by
//!   the buffer distance, in parallel, before any check runs.
//! - **Deferred**: start from the owned shards and expand ring by ring.
//!   Ring 1 pulls the same buffered region eager loads, plus any shard
//!   within the buffer of an entity reached in ring 0. Later rings pull
//!   shards within the buffer of entities connected to something already
//!   reached. Relation-aware mode also pulls every shard touched by a
//!   reached relation, transitively.
//!
//! Fetch failures are holes, never errors: the loader returns the largest
//! view it could assemble.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use crate::graph::AssembledGraph;
use crate::policy::{
    BoundedFrontier, ExpansionReason, FrontierCandidate, FrontierPolicy, LoaderPolicy,
    LoadingStrategy,
};
use crate::sharding::ShardingIndex;
use crate::store::AtlasFetcher;
use crate::types::{Entity, EntityId, EntityKind, GraphFragment, Rectangle, ShardGroup, ShardId};

/// Error type for loader operations.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The shard group has no shards.
    #[error("Shard group {0} is empty")]
    EmptyGroup(String),
    /// None of the group's own shards could be fetched.
    #[error("No data for {country} in any shard of group {group}")]
    NoData {
        /// Country.
        country: String,
        /// Shard group name.
        group: String,
    },
}

type Fetched = BTreeMap<ShardId, Arc<GraphFragment>>;

/// Boundary-aware graph loader.
pub struct BoundaryAwareGraphLoader<F: AtlasFetcher> {
    fetcher: Arc<F>,
    sharding: Arc<dyn ShardingIndex>,
    policy: LoaderPolicy,
    frontier: Arc<dyn FrontierPolicy>,
}

impl<F: AtlasFetcher + 'static> BoundaryAwareGraphLoader<F> {
    /// Create a loader. The frontier stop rule is derived from the policy.
    pub fn new(fetcher: Arc<F>, sharding: Arc<dyn ShardingIndex>, policy: LoaderPolicy) -> Self {
        let relation_closure = matches!(
            policy.strategy,
            LoadingStrategy::Deferred {
                relation_aware: true
            }
        );
        let frontier = Arc::new(BoundedFrontier {
            max_iterations: policy.max_iterations,
            max_radius: policy.effective_radius(),
            relation_closure,
        });
        Self {
            fetcher,
            sharding,
            policy,
            frontier,
        }
    }

    /// Replace the frontier stop rule.
    pub fn with_frontier(mut self, frontier: Arc<dyn FrontierPolicy>) -> Self {
        self.frontier = frontier;
        self
    }

    /// Get the policy.
    pub fn policy(&self) -> &LoaderPolicy {
        &self.policy
    }

    /// Get a reference to the fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Assemble the graph for `country` around `group`.
    pub async fn load(
        &self,
        country: &str,
        group: &ShardGroup,
    ) -> Result<AssembledGraph, LoaderError> {
        let nominal = group
            .bounds()
            .ok_or_else(|| LoaderError::EmptyGroup(group.name().to_string()))?;
        let started = Instant::now();

        let (fragments, holes, expanded) = match self.policy.strategy {
            LoadingStrategy::Eager => self.load_eager(country, group, nominal).await,
            LoadingStrategy::Deferred { relation_aware } => {
                self.load_deferred(country, group, nominal, relation_aware).await
            }
        };

        if !group.shards().iter().any(|s| fragments.contains_key(&s.id)) {
            return Err(LoaderError::NoData {
                country: country.to_string(),
                group: group.name().to_string(),
            });
        }

        let graph = AssembledGraph::new(country, group, nominal, expanded, fragments, holes);
        tracing::debug!(
            country,
            task = %group.name(),
            strategy = %self.policy.strategy,
            shards = graph.loaded_shards().count(),
            holes = graph.missing_shards().len(),
            entities = graph.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Assembled graph"
        );
        Ok(graph)
    }

    async fn load_eager(
        &self,
        country: &str,
        group: &ShardGroup,
        nominal: Rectangle,
    ) -> (Fetched, BTreeSet<ShardId>, Rectangle) {
        let expanded = nominal.expand(self.policy.buffer_distance);
        let mut wanted: BTreeSet<ShardId> = group.shard_ids();
        wanted.extend(self.sharding.shards_intersecting(&expanded).iter().map(|s| s.id));

        let (fragments, holes) = self.fetch_all(country, wanted).await;
        (fragments, holes, expanded)
    }

    async fn load_deferred(
        &self,
        country: &str,
        group: &ShardGroup,
        nominal: Rectangle,
        relation_aware: bool,
    ) -> (Fetched, BTreeSet<ShardId>, Rectangle) {
        let buffer = self.policy.buffer_distance;
        let mut visited: BTreeSet<ShardId> = group.shard_ids();
        let (mut fragments, mut holes) = self.fetch_all(country, visited.clone()).await;

        let mut reached = Reached::default();
        let ring_zero: Vec<&Entity> = fragments.values().flat_map(|f| f.entities()).collect();
        for entity in &ring_zero {
            reached.insert(entity);
        }
        let mut newly_reached: Vec<Entity> = ring_zero.into_iter().cloned().collect();

        let mut ring = 0u32;
        let mut expanded = nominal;
        while self.frontier.continue_after(ring) && !newly_reached.is_empty() {
            ring += 1;
            let mut frontier: BinaryHeap<FrontierCandidate> = BinaryHeap::new();
            let mut queued: BTreeSet<ShardId> = BTreeSet::new();

            let mut regions: Vec<(Rectangle, ExpansionReason)> = Vec::new();
            if ring == 1 {
                // Features anchored next door may still cross into the owned shards.
                regions.push((nominal.expand(buffer), ExpansionReason::Traversal));
            }
            for entity in &newly_reached {
                let Some(bounds) = entity.bounds() else {
                    continue;
                };
                regions.push((bounds.expand(buffer), ExpansionReason::Traversal));
                if relation_aware && entity.id.kind == EntityKind::Relation {
                    regions.push((bounds, ExpansionReason::RelationClosure));
                }
            }
            for (region, reason) in regions {
                for shard in self.sharding.shards_intersecting(&region) {
                    if visited.contains(&shard.id) {
                        continue;
                    }
                    let candidate = FrontierCandidate::new(
                        shard,
                        ring,
                        shard.bounds.distance_to(&nominal),
                        reason,
                    );
                    if self.frontier.admit(&candidate) && queued.insert(shard.id) {
                        frontier.push(candidate);
                    }
                }
            }

            if frontier.is_empty() {
                break;
            }

            let mut batch = BTreeSet::new();
            while let Some(candidate) = frontier.pop() {
                expanded = expanded.union(&candidate.shard.bounds);
                batch.insert(candidate.shard.id);
            }
            visited.extend(batch.iter().copied());
            tracing::trace!(country, task = %group.name(), ring, shards = batch.len(), "Expanding frontier");

            let (loaded, missing) = self.fetch_all(country, batch).await;
            holes.extend(missing);
            let incoming: Vec<&Entity> = loaded
                .values()
                .flat_map(|f| f.entities())
                .filter(|e| !reached.contains(&e.id))
                .collect();
            newly_reached = reached.absorb_connected(incoming);
            fragments.extend(loaded);
        }

        (fragments, holes, expanded)
    }

    /// Fetch shards in parallel. Failed and empty fetches become holes.
    async fn fetch_all(
        &self,
        country: &str,
        shards: BTreeSet<ShardId>,
    ) -> (Fetched, BTreeSet<ShardId>) {
        let mut set = JoinSet::new();
        for shard in shards {
            let fetcher = Arc::clone(&self.fetcher);
            let country = country.to_string();
            set.spawn(async move {
                let result = fetcher.fetch(&country, &shard).await;
                (shard, result)
            });
        }

        let mut fragments = BTreeMap::new();
        let mut holes = BTreeSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((shard, Ok(Some(fragment)))) => {
                    fragments.insert(shard, fragment);
                }
                Ok((shard, Ok(None))) => {
                    holes.insert(shard);
                }
                Ok((shard, Err(error))) => {
                    tracing::warn!(country, shard = %shard, error = %error, "Fragment fetch failed; continuing without it");
                    holes.insert(shard);
                }
                Err(error) => {
                    tracing::warn!(country, error = %error, "Fragment fetch aborted");
                }
            }
        }
        (fragments, holes)
    }
}

/// Entities reached by deferred traversal.
#[derive(Default)]
struct Reached {
    ids: BTreeSet<EntityId>,
    referenced: BTreeSet<EntityId>,
}

impl Reached {
    fn insert(&mut self, entity: &Entity) {
        self.ids.insert(entity.id);
        self.referenced.extend(entity.references());
    }

    fn contains(&self, id: &EntityId) -> bool {
        self.ids.contains(id)
    }

    fn connects(&self, entity: &Entity) -> bool {
        self.referenced.contains(&entity.id)
            || entity
                .references()
                .any(|r| self.ids.contains(&r) || self.referenced.contains(&r))
    }

    /// Reach every incoming entity connected to the reached set, to a fixpoint.
    fn absorb_connected(&mut self, mut incoming: Vec<&Entity>) -> Vec<Entity> {
        let mut absorbed = Vec::new();
        loop {
            let (connected, rest): (Vec<&Entity>, Vec<&Entity>) =
                incoming.into_iter().partition(|e| self.connects(e));
            if connected.is_empty() {
                break;
            }
            for entity in connected {
                self.insert(entity);
                absorbed.push(entity.clone());
            }
            incoming = rest;
        }
        absorbed
    }
}
