//! End-to-end check job.
//!
//! ```text
//! catalog → registry → schedule → execute (load, run, collect) → merge
//!        → render flags → commit per country → cleanup
//! ```
//!
//! Fatal errors stop the job before any task runs. Per-country problems
//! (no checks, no shard data, failed assembly) exclude that country and are
//! listed in the [`JobReport`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregator::FlagContainer;
use crate::checks::CheckRegistry;
use crate::config::{ConfigError, JobConfig, OutputFormat};
use crate::events::Processor;
use crate::loader::BoundaryAwareGraphLoader;
use crate::runner::{CheckRunner, TicketClient};
use crate::scheduler::{ProcessorFactory, SchedulerError, TaskScheduler};
use crate::sharding::AvailableShards;
use crate::sinks::{FlagFileProcessor, MetricFileProcessor, OutputLayout, SinkError};
use crate::store::{CacheStats, CachingFetcher, DirectoryAtlasFetcher, FetchError};
use crate::types::{Shard, TaskKey};
use crate::SHARDED_CHECKS_SCHEMA_VERSION;

type MetricSinks = Arc<Mutex<BTreeMap<String, Vec<Arc<MetricFileProcessor>>>>>;

/// Error type for a job run.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The shard catalog could not be read.
    #[error("Could not list shards: {0}")]
    Catalog(#[from] FetchError),
    /// Nothing to run.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// Output could not be written or committed.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Per-country result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CountryReport {
    /// Tasks run.
    pub tasks: usize,
    /// Distinct flags after the merge.
    pub flags: usize,
    /// Distinct flags per check.
    pub flags_by_check: BTreeMap<String, usize>,
    /// Fingerprint of the merged container.
    pub fingerprint: String,
}

/// Summary of a job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Report format version.
    pub schema_version: String,
    /// Run identifier.
    pub run_id: Uuid,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Loader policy identifier.
    pub loader_policy: String,
    /// Committed countries.
    pub countries: BTreeMap<String, CountryReport>,
    /// Excluded countries and why.
    pub excluded: BTreeMap<String, String>,
    /// Failed or timed out checks per task stream.
    pub failed_checks: BTreeMap<String, Vec<String>>,
    /// Output files dropped because a write failed, with the error.
    pub incomplete_outputs: BTreeMap<String, String>,
    /// Fragment cache statistics.
    pub cache: Option<CacheStats>,
}

impl JobReport {
    /// Total flags across committed countries.
    pub fn total_flags(&self) -> usize {
        self.countries.values().map(|c| c.flags).sum()
    }
}

/// A configured job.
pub struct CheckJob {
    config: JobConfig,
    registry: CheckRegistry,
    ticket_client: Option<Arc<dyn TicketClient>>,
}

impl CheckJob {
    /// Job over the built-in checks.
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            registry: CheckRegistry::builtin(),
            ticket_client: None,
        }
    }

    /// Replace the check registry.
    pub fn with_registry(mut self, registry: CheckRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Forward each check's flags to a ticket client.
    pub fn with_ticket_client(mut self, client: Arc<dyn TicketClient>) -> Self {
        self.ticket_client = Some(client);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run the job to completion.
    pub async fn run(&self) -> Result<JobReport, JobError> {
        let config = &self.config;
        config.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            run_id = %run_id,
            countries = config.countries.len(),
            strategy = %config.loader.strategy,
            buffer = %config.loader.buffer_distance,
            "Starting check job"
        );

        let fetcher = DirectoryAtlasFetcher::new(&config.input);
        let catalog = fetcher.catalog()?;
        let checks = self
            .registry
            .load_for_countries(&config.checks, &config.countries);

        let scheduler = TaskScheduler::new()
            .with_grouping(config.grouping, config.max_shard_load)
            .with_buffer(config.loader.buffer_distance)
            .with_priority_countries(config.priority_countries.clone())
            .with_max_concurrent_tasks(config.max_concurrent_tasks);
        let schedule = scheduler.schedule(&config.countries, &catalog, &checks)?;

        let mut excluded: BTreeMap<String, String> = schedule
            .excluded
            .iter()
            .map(|(country, reason)| (country.clone(), reason.to_string()))
            .collect();
        let mut tasks_per_country: BTreeMap<String, usize> = BTreeMap::new();
        for task in &schedule.tasks {
            *tasks_per_country.entry(task.country().to_string()).or_default() += 1;
        }

        let sharding = match config.load_sharding()? {
            Some(ids) => {
                tracing::info!(shards = ids.len(), "Using alternate sharding");
                AvailableShards::from_ids(ids)
            }
            None => {
                let scheduled: BTreeSet<&String> = tasks_per_country.keys().collect();
                AvailableShards::new(
                    catalog
                        .iter()
                        .filter(|(country, _)| scheduled.contains(country))
                        .flat_map(|(_, shards)| shards.iter().copied())
                        .collect::<Vec<Shard>>(),
                )
            }
        };
        let fetcher = Arc::new(CachingFetcher::with_config(fetcher, config.cache.clone()));
        let loader = Arc::new(BoundaryAwareGraphLoader::new(
            fetcher,
            Arc::new(sharding),
            config.loader.clone(),
        ));

        let mut runner = CheckRunner::new()
            .with_kill_after(config.pool_kill())
            .with_filter(config.candidate_filter);
        if let Some(client) = &self.ticket_client {
            runner = runner.with_ticket_client(Arc::clone(client));
        }

        let layout = OutputLayout::new(&config.output);
        let sinks: MetricSinks = Arc::default();
        let processors = metric_sinks(&layout, &config.output_formats, &sinks);
        let execution = scheduler
            .execute(schedule, Arc::clone(&loader), Arc::new(runner), processors)
            .await;

        excluded.extend(
            execution
                .excluded
                .iter()
                .map(|(country, reason)| (country.clone(), reason.to_string())),
        );
        let failed_checks: BTreeMap<String, Vec<String>> = execution
            .summaries
            .iter()
            .filter(|s| !s.failed().is_empty())
            .map(|s| {
                let failed = s.failed().into_iter().map(str::to_string).collect();
                (s.stream.clone(), failed)
            })
            .collect();

        let mut countries = BTreeMap::new();
        let mut incomplete_outputs = BTreeMap::new();
        let committed = self.commit(
            &layout,
            &execution.containers,
            &tasks_per_country,
            &sinks,
            &mut countries,
            &mut incomplete_outputs,
        );
        layout.cleanup();
        committed?;

        let report = JobReport {
            schema_version: SHARDED_CHECKS_SCHEMA_VERSION.to_string(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            loader_policy: config.loader.policy_id().to_string(),
            countries,
            excluded,
            failed_checks,
            incomplete_outputs,
            cache: loader.fetcher().stats(),
        };
        tracing::info!(
            run_id = %report.run_id,
            countries = report.countries.len(),
            excluded = report.excluded.len(),
            flags = report.total_flags(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Check job finished"
        );
        Ok(report)
    }

    fn commit(
        &self,
        layout: &OutputLayout,
        containers: &BTreeMap<String, FlagContainer>,
        tasks_per_country: &BTreeMap<String, usize>,
        sinks: &MetricSinks,
        reports: &mut BTreeMap<String, CountryReport>,
        incomplete: &mut BTreeMap<String, String>,
    ) -> Result<(), JobError> {
        let formats = &self.config.output_formats;
        for (country, container) in containers {
            if formats.contains(&OutputFormat::Flags) {
                FlagFileProcessor::new(layout, country, country).render(container)?;
            }
            let mut skip: BTreeSet<PathBuf> = BTreeSet::new();
            let staged = sinks.lock().remove(country).unwrap_or_default();
            for sink in staged {
                if let Err(error) = sink.finish() {
                    tracing::warn!(country = %country, path = %sink.path().display(), error = %error, "Dropping incomplete metrics");
                    incomplete.insert(sink.path().display().to_string(), error.to_string());
                    skip.insert(sink.path().to_path_buf());
                }
            }
            layout.commit_excluding(country, formats, &skip)?;
            reports.insert(
                country.clone(),
                CountryReport {
                    tasks: tasks_per_country.get(country).copied().unwrap_or(0),
                    flags: container.len(),
                    flags_by_check: container.counts(),
                    fingerprint: container.fingerprint(),
                },
            );
        }
        Ok(())
    }
}

/// Per-task metric sinks, remembered per country so they can be checked
/// before commit.
fn metric_sinks(
    layout: &OutputLayout,
    formats: &[OutputFormat],
    sinks: &MetricSinks,
) -> Option<ProcessorFactory> {
    if !formats.contains(&OutputFormat::Metrics) {
        return None;
    }
    let layout = layout.clone();
    let sinks = Arc::clone(sinks);
    let factory: ProcessorFactory = Arc::new(move |key: &TaskKey| {
        let sink = Arc::new(MetricFileProcessor::new(
            &layout,
            &key.country,
            &key.to_string(),
        ));
        sinks
            .lock()
            .entry(key.country.clone())
            .or_default()
            .push(Arc::clone(&sink));
        let sink: Arc<dyn Processor> = sink;
        vec![sink]
    });
    Some(factory)
}
