//! Task partitioning, parallel execution and per-country merge.
//!
//! ## Flow
//!
//! 1. [`TaskScheduler::schedule`] turns countries × shard groups into [`Task`]s,
//!    each carrying the country's full check list.
//! 2. [`TaskScheduler::execute`] runs tasks concurrently (bounded by a
//!    semaphore). Each task assembles its graph, opens its own event stream,
//!    runs its checks and hands back a [`FlagContainer`].
//! 3. All containers of a country are folded with [`FlagContainer::combine`].
//!    Combine is associative and commutative, so completion order is irrelevant.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregator::{FlagCollector, FlagContainer};
use crate::checks::Check;
use crate::events::{EventStream, Processor};
use crate::loader::BoundaryAwareGraphLoader;
use crate::runner::{CheckRunner, RunSummary};
use crate::sharding::{AvailableShards, ShardingIndex};
use crate::store::AtlasFetcher;
use crate::types::{Distance, Rectangle, Shard, ShardGroup, Task, TaskKey};

/// Error type for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// No countries to run.
    #[error("No countries found to run")]
    NoCountries,
    /// No country has a single check.
    #[error("No checks loaded for any of the countries provided")]
    NoChecks,
    /// No country with checks has shard data.
    #[error("No shard data found for any of the countries provided")]
    NoShardData,
}

/// How a country's shards become tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// One task per shard.
    #[default]
    PerShard,
    /// Quad-tree groups bounded by the max shard load.
    Bounded,
}

/// Groups shards so that no group loads more than `max_shard_load` shards.
///
/// Starting at zoom 0, each shard goes into the tile enclosing it. A bucket
/// whose buffered bounds would touch more than `max_shard_load` shards is
/// split one zoom level down. A single-shard bucket over the limit is kept
/// as is, with a warning.
pub struct ShardGrouper<'a> {
    index: &'a dyn ShardingIndex,
    max_shard_load: usize,
    buffer: Distance,
}

impl<'a> ShardGrouper<'a> {
    /// Create a grouper over the shards visible through `index`.
    pub fn new(index: &'a dyn ShardingIndex, max_shard_load: usize, buffer: Distance) -> Self {
        Self {
            index,
            max_shard_load,
            buffer,
        }
    }

    /// Group `shards`. Groups come back ordered by name.
    pub fn groups(&self, shards: &[Shard]) -> Vec<ShardGroup> {
        let mut groups = self.groups_at(shards.to_vec(), 0);
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    fn load(&self, shards: &[Shard]) -> usize {
        Rectangle::covering_all(shards.iter().map(|s| &s.bounds))
            .map(|bounds| self.index.shards_intersecting(&bounds.expand(self.buffer)).len())
            .unwrap_or(0)
    }

    fn groups_at(&self, shards: Vec<Shard>, zoom: u8) -> Vec<ShardGroup> {
        let mut buckets: BTreeMap<_, Vec<Shard>> = BTreeMap::new();
        let mut groups = Vec::new();
        for shard in shards {
            match shard.id.ancestor(zoom) {
                Some(bucket) => buckets.entry(bucket).or_default().push(shard),
                None => groups.push(ShardGroup::single(shard)),
            }
        }

        for (bucket, members) in buckets {
            let load = self.load(&members);
            if load <= self.max_shard_load {
                groups.push(ShardGroup::new(bucket.name(), members));
            } else if members.len() == 1 {
                tracing::warn!(
                    shard = %members[0].id,
                    load,
                    max_shard_load = self.max_shard_load,
                    "Shard alone exceeds the max shard load"
                );
                groups.push(ShardGroup::single(members[0]));
            } else {
                groups.extend(self.groups_at(members, zoom + 1));
            }
        }
        groups
    }
}

/// Why a country produced no output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    /// No check is valid for the country.
    NoChecks,
    /// No shard data for the country.
    NoShardData,
    /// Graph assembly failed for one of its tasks.
    LoadFailed(String),
    /// A task aborted unexpectedly.
    TaskAborted(String),
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChecks => write!(f, "no checks loaded"),
            Self::NoShardData => write!(f, "no shard data"),
            Self::LoadFailed(e) => write!(f, "graph assembly failed: {}", e),
            Self::TaskAborted(e) => write!(f, "task aborted: {}", e),
        }
    }
}

/// Output of [`TaskScheduler::schedule`].
#[derive(Debug, Default)]
pub struct Schedule {
    /// Tasks in execution order.
    pub tasks: Vec<Task>,
    /// Countries skipped at scheduling time.
    pub excluded: BTreeMap<String, Exclusion>,
}

impl IntoIterator for Schedule {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

/// Output of [`TaskScheduler::execute`].
#[derive(Debug, Default)]
pub struct Execution {
    /// Merged flags per country.
    pub containers: BTreeMap<String, FlagContainer>,
    /// Per-task run summaries, ordered by stream name.
    pub summaries: Vec<RunSummary>,
    /// Countries dropped during execution.
    pub excluded: BTreeMap<String, Exclusion>,
}

/// Builds extra processors for a task's event stream (output sinks).
pub type ProcessorFactory = Arc<dyn Fn(&TaskKey) -> Vec<Arc<dyn Processor>> + Send + Sync>;

enum TaskOutcome {
    Done(FlagContainer, RunSummary),
    LoadFailed(String),
}

/// Partitions work into tasks and drives their execution.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    grouping: GroupingMode,
    max_shard_load: usize,
    buffer: Distance,
    priority_countries: Vec<String>,
    max_concurrent_tasks: usize,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self {
            grouping: GroupingMode::PerShard,
            max_shard_load: crate::config::DEFAULT_MAX_SHARD_LOAD,
            buffer: Distance::kilometers(10.0),
            priority_countries: Vec::new(),
            max_concurrent_tasks: 4,
        }
    }
}

impl TaskScheduler {
    /// Scheduler with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the grouping mode and its load bound.
    pub fn with_grouping(mut self, grouping: GroupingMode, max_shard_load: usize) -> Self {
        self.grouping = grouping;
        self.max_shard_load = max_shard_load.max(1);
        self
    }

    /// Buffer used when measuring group load.
    pub fn with_buffer(mut self, buffer: Distance) -> Self {
        self.buffer = buffer;
        self
    }

    /// Countries to schedule first.
    pub fn with_priority_countries(mut self, countries: Vec<String>) -> Self {
        self.priority_countries = countries;
        self
    }

    /// Tasks running at once.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Countries in scheduling order: priority countries first, then the rest
    /// in input order. Duplicates are dropped.
    pub fn order_countries(&self, countries: &[String]) -> Vec<String> {
        let requested: BTreeSet<&String> = countries.iter().collect();
        let mut seen = BTreeSet::new();
        self.priority_countries
            .iter()
            .filter(|c| requested.contains(c))
            .chain(countries.iter())
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect()
    }

    /// One task per (country, shard group), carrying the country's checks.
    pub fn schedule(
        &self,
        countries: &[String],
        catalog: &BTreeMap<String, Vec<Shard>>,
        checks_by_country: &BTreeMap<String, Vec<Arc<dyn Check>>>,
    ) -> Result<Schedule, SchedulerError> {
        if countries.is_empty() {
            tracing::error!("No countries found to run");
            return Err(SchedulerError::NoCountries);
        }

        let mut schedule = Schedule::default();
        let ordered = self.order_countries(countries);
        let mut with_checks = Vec::new();
        for country in &ordered {
            match checks_by_country.get(country) {
                Some(checks) if !checks.is_empty() => with_checks.push((country, checks)),
                _ => {
                    tracing::warn!(country = %country, "No checks loaded for country. Skipping execution");
                    schedule.excluded.insert(country.clone(), Exclusion::NoChecks);
                }
            }
        }
        if with_checks.is_empty() {
            tracing::error!("No checks loaded for any of the countries provided");
            return Err(SchedulerError::NoChecks);
        }

        let mut any_shards = false;
        for (country, checks) in with_checks {
            let shards = catalog.get(country).map(Vec::as_slice).unwrap_or(&[]);
            if shards.is_empty() {
                tracing::warn!(country = %country, "No shard data found for country");
                schedule.excluded.insert(country.clone(), Exclusion::NoShardData);
                continue;
            }
            any_shards = true;

            let groups: Vec<ShardGroup> = match self.grouping {
                GroupingMode::PerShard => shards.iter().copied().map(ShardGroup::single).collect(),
                GroupingMode::Bounded => {
                    let index = AvailableShards::new(shards.iter().copied());
                    ShardGrouper::new(&index, self.max_shard_load, self.buffer).groups(shards)
                }
            };
            tracing::info!(country = %country, shards = shards.len(), tasks = groups.len(), checks = checks.len(), "Scheduled country");
            schedule
                .tasks
                .extend(groups.into_iter().map(|g| Task::new(country.clone(), g, checks.clone())));
        }
        if !any_shards {
            tracing::error!("No shard data found for any of the countries provided");
            return Err(SchedulerError::NoShardData);
        }
        Ok(schedule)
    }

    /// Run tasks and fold each country's containers.
    ///
    /// A country with any task whose graph could not be assembled is excluded
    /// from the result; other countries proceed.
    pub async fn execute<F: AtlasFetcher + 'static>(
        &self,
        tasks: impl IntoIterator<Item = Task>,
        loader: Arc<BoundaryAwareGraphLoader<F>>,
        runner: Arc<CheckRunner>,
        processors: Option<ProcessorFactory>,
    ) -> Execution {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        let mut set = JoinSet::new();
        let mut task_count = 0usize;

        for task in tasks {
            task_count += 1;
            let loader = Arc::clone(&loader);
            let runner = Arc::clone(&runner);
            let processors = processors.clone();
            let permits = Arc::clone(&permits);
            let key = task.key();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let inner = tokio::spawn(run_task(task, loader, runner, processors));
                let outcome = inner.await.map_err(|e| e.to_string());
                (key, outcome)
            });
        }

        let mut execution = Execution::default();
        let mut per_country: BTreeMap<String, Vec<FlagContainer>> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (key, outcome) = match joined {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!(error = %error, "Task scheduling slot lost");
                    continue;
                }
            };
            match outcome {
                Ok(TaskOutcome::Done(container, summary)) => {
                    per_country.entry(key.country).or_default().push(container);
                    execution.summaries.push(summary);
                }
                Ok(TaskOutcome::LoadFailed(error)) => {
                    tracing::error!(country = %key.country, task = %key, error = %error, "Graph assembly failed; excluding country");
                    execution
                        .excluded
                        .entry(key.country)
                        .or_insert(Exclusion::LoadFailed(error));
                }
                Err(error) => {
                    tracing::error!(country = %key.country, task = %key, error = %error, "Task aborted; excluding country");
                    execution
                        .excluded
                        .entry(key.country)
                        .or_insert(Exclusion::TaskAborted(error));
                }
            }
        }

        for (country, containers) in per_country {
            if execution.excluded.contains_key(&country) {
                continue;
            }
            let merged = combine_all(containers);
            tracing::info!(country = %country, flags = merged.len(), "Merged country flags");
            execution.containers.insert(country, merged);
        }
        execution.summaries.sort_by(|a, b| a.stream.cmp(&b.stream));
        tracing::info!(
            tasks = task_count,
            countries = execution.containers.len(),
            excluded = execution.excluded.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        execution
    }
}

/// Fold containers with `combine`.
pub fn combine_all<I: IntoIterator<Item = FlagContainer>>(containers: I) -> FlagContainer {
    containers
        .into_iter()
        .fold(FlagContainer::new(), FlagContainer::combine)
}

async fn run_task<F: AtlasFetcher + 'static>(
    task: Task,
    loader: Arc<BoundaryAwareGraphLoader<F>>,
    runner: Arc<CheckRunner>,
    processors: Option<ProcessorFactory>,
) -> TaskOutcome {
    let key = task.key();
    let graph = match loader.load(task.country(), task.group()).await {
        Ok(graph) => Arc::new(graph),
        Err(error) => return TaskOutcome::LoadFailed(error.to_string()),
    };

    let stream = Arc::new(EventStream::new(key.to_string()));
    let collector = Arc::new(FlagCollector::new());
    let mut subscribers: Vec<Arc<dyn Processor>> = Vec::new();
    subscribers.push(collector.clone());
    if let Some(factory) = &processors {
        subscribers.extend(factory(&key));
    }
    for subscriber in subscribers {
        if let Err(error) = stream.register(subscriber) {
            tracing::error!(task = %key, error = %error, "Processor registration failed");
        }
    }

    let summary = runner
        .run(task.country(), task.checks(), graph, Arc::clone(&stream))
        .await;
    stream.complete();
    TaskOutcome::Done(collector.take(), summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{CheckSettings, OrphanEdgeCheck};
    use crate::types::ShardId;

    fn checks() -> Vec<Arc<dyn Check>> {
        vec![Arc::new(OrphanEdgeCheck::new(CheckSettings::default()))]
    }

    fn grid(zoom: u8, x0: u32, y0: u32, n: u32) -> Vec<Shard> {
        (0..n)
            .flat_map(|dx| (0..n).map(move |dy| Shard::from_id(ShardId::new(zoom, x0 + dx, y0 + dy))))
            .collect()
    }

    #[test]
    fn test_fatal_no_countries() {
        let err = TaskScheduler::new()
            .schedule(&[], &BTreeMap::new(), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoCountries);
    }

    #[test]
    fn test_fatal_no_checks() {
        let countries = vec!["XYZ".to_string()];
        let catalog = BTreeMap::from([("XYZ".to_string(), grid(10, 0, 0, 1))]);
        let by_country = BTreeMap::from([("XYZ".to_string(), Vec::new())]);
        let err = TaskScheduler::new()
            .schedule(&countries, &catalog, &by_country)
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoChecks);
    }

    #[test]
    fn test_fatal_no_shard_data() {
        let countries = vec!["XYZ".to_string()];
        let by_country = BTreeMap::from([("XYZ".to_string(), checks())]);
        let err = TaskScheduler::new()
            .schedule(&countries, &BTreeMap::new(), &by_country)
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoShardData);
    }

    #[test]
    fn test_country_without_checks_skipped() {
        let countries = vec!["ABC".to_string(), "XYZ".to_string()];
        let catalog = BTreeMap::from([
            ("ABC".to_string(), grid(10, 0, 0, 1)),
            ("XYZ".to_string(), grid(10, 0, 0, 2)),
        ]);
        let by_country = BTreeMap::from([("XYZ".to_string(), checks())]);
        let schedule = TaskScheduler::new()
            .schedule(&countries, &catalog, &by_country)
            .unwrap();

        assert_eq!(schedule.tasks.len(), 4);
        assert!(schedule.tasks.iter().all(|t| t.country() == "XYZ"));
        assert_eq!(schedule.excluded["ABC"], Exclusion::NoChecks);
    }

    #[test]
    fn test_priority_countries_first() {
        let scheduler = TaskScheduler::new().with_priority_countries(vec!["DEF".into(), "QQQ".into()]);
        let order = scheduler.order_countries(&["ABC".into(), "DEF".into(), "ABC".into()]);
        assert_eq!(order, vec!["DEF", "ABC"]);
    }

    #[test]
    fn test_grouper_respects_load() {
        let shards = grid(10, 100, 100, 4);
        let index = AvailableShards::new(shards.iter().copied());
        let groups = ShardGrouper::new(&index, 9, Distance::kilometers(1.0)).groups(&shards);

        let total: usize = groups.iter().map(ShardGroup::len).sum();
        assert_eq!(total, 16);
        for group in &groups {
            let bounds = group.bounds().unwrap().expand(Distance::kilometers(1.0));
            assert!(index.shards_intersecting(&bounds).len() <= 9 || group.len() == 1);
        }
        let names: BTreeSet<&str> = groups.iter().map(ShardGroup::name).collect();
        assert_eq!(names.len(), groups.len());
    }

    #[test]
    fn test_grouper_single_group_when_load_allows() {
        let shards = grid(10, 100, 100, 2);
        let index = AvailableShards::new(shards.iter().copied());
        let groups = ShardGrouper::new(&index, 60, Distance::kilometers(10.0)).groups(&shards);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 4);
    }

    #[test]
    fn test_grouper_oversized_single_shard_kept() {
        let shards = grid(10, 100, 100, 3);
        let index = AvailableShards::new(shards.iter().copied());
        let groups = ShardGrouper::new(&index, 1, Distance::kilometers(1.0)).groups(&shards);
        assert_eq!(groups.len(), 9);
        assert!(groups.iter().all(|g| g.len() == 1));
    }
}
