//! Concurrent per-task check execution.
//!
//! Every check of a task runs on its own blocking worker; the pool is as
//! large as the check list. A check's candidate loop is sequential. Errors
//! and panics inside one check fail only that check. A coarse wall-clock
//! kill threshold guards against leaked workers: when it fires, every
//! worker stops at its next candidate boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::checks::{Candidate, Check, CheckContext, CheckError, CheckScratch, ComplexEntity};
use crate::events::{CheckEvent, EventStream};
use crate::graph::AssembledGraph;
use crate::types::{Entity, Flag, Rectangle};

/// Default pool kill threshold: 300 minutes.
pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(300 * 60);

/// Error returned by a ticket client.
#[derive(Debug, thiserror::Error)]
#[error("Ticket upload failed for {check}: {message}")]
pub struct TicketError {
    /// Check whose flags were being uploaded.
    pub check: String,
    /// Message.
    pub message: String,
}

/// External ticket service. Used only outside the merged pipeline.
pub trait TicketClient: Send + Sync {
    /// Upload one check's flags.
    fn upload(&self, check_name: &str, flags: &[Flag]) -> Result<(), TicketError>;
}

/// Which plain entities a check sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateFilter {
    /// Entities stored in the task's own shards.
    #[default]
    Owned,
    /// Every loaded entity, buffer included.
    All,
    /// Entities whose anchor lies inside a rectangle.
    Within(Rectangle),
}

impl CandidateFilter {
    fn accepts(&self, graph: &AssembledGraph, entity: &Entity) -> bool {
        match self {
            Self::Owned => graph.owns(&entity.id),
            Self::All => true,
            Self::Within(bounds) => entity.anchor().is_some_and(|a| bounds.contains(&a)),
        }
    }

    fn accepts_complex(&self, graph: &AssembledGraph, complex: &ComplexEntity) -> bool {
        match self {
            Self::Owned => complex.members.iter().any(|id| graph.owns(id)),
            Self::All => true,
            Self::Within(bounds) => complex.location.is_some_and(|l| bounds.contains(&l)),
        }
    }
}

/// How one check ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Every candidate was evaluated.
    Completed {
        /// Flags posted.
        flags: usize,
        /// Wall time.
        elapsed_ms: u64,
    },
    /// The check raised an error or panicked.
    Failed {
        /// Error description.
        error: String,
    },
    /// Not valid for the country.
    Skipped,
    /// Still running when the pool was killed.
    TimedOut,
}

/// Result of running a task's checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Country.
    pub country: String,
    /// Event stream name.
    pub stream: String,
    /// Outcome per check name.
    pub outcomes: BTreeMap<String, CheckOutcome>,
}

impl RunSummary {
    /// Names of checks that failed or timed out.
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CheckOutcome::Failed { .. } | CheckOutcome::TimedOut))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Number of completed checks.
    pub fn completed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, CheckOutcome::Completed { .. }))
            .count()
    }

    /// Flags posted by completed checks.
    pub fn flags_posted(&self) -> usize {
        self.outcomes
            .values()
            .map(|o| match o {
                CheckOutcome::Completed { flags, .. } => *flags,
                _ => 0,
            })
            .sum()
    }
}

/// Runs a country's checks over one assembled graph.
#[derive(Clone)]
pub struct CheckRunner {
    kill_after: Duration,
    filter: CandidateFilter,
    ticket_client: Option<Arc<dyn TicketClient>>,
}

impl Default for CheckRunner {
    fn default() -> Self {
        Self {
            kill_after: DEFAULT_KILL_AFTER,
            filter: CandidateFilter::default(),
            ticket_client: None,
        }
    }
}

impl CheckRunner {
    /// Runner with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool kill threshold.
    pub fn with_kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = kill_after;
        self
    }

    /// Set the candidate filter.
    pub fn with_filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Forward flags to a ticket client after each check.
    pub fn with_ticket_client(mut self, client: Arc<dyn TicketClient>) -> Self {
        self.ticket_client = Some(client);
        self
    }

    /// Run `checks` for `country` over `graph`, posting to `stream`.
    ///
    /// Does not complete the stream; the caller owns its lifetime.
    pub async fn run(
        &self,
        country: &str,
        checks: &[Arc<dyn Check>],
        graph: Arc<AssembledGraph>,
        stream: Arc<EventStream>,
    ) -> RunSummary {
        let mut outcomes = BTreeMap::new();
        let mut pool = JoinSet::new();
        let cancelled = Arc::new(AtomicBool::new(false));

        for check in checks {
            let name = check.name().to_string();
            if !check.valid_for_country(country) {
                outcomes.insert(name, CheckOutcome::Skipped);
                continue;
            }
            outcomes.insert(name.clone(), CheckOutcome::TimedOut);

            let check = Arc::clone(check);
            let graph = Arc::clone(&graph);
            let stream = Arc::clone(&stream);
            let country = country.to_string();
            let filter = self.filter;
            let ticket_client = self.ticket_client.clone();
            let cancelled = Arc::clone(&cancelled);
            pool.spawn_blocking(move || {
                let started = Instant::now();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_check(
                        check.as_ref(),
                        &country,
                        &graph,
                        &stream,
                        filter,
                        ticket_client.as_deref(),
                        &cancelled,
                    )
                }));
                let outcome = match result {
                    Ok(Ok(flags)) => CheckOutcome::Completed {
                        flags,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    Ok(Err(CheckError::Cancelled { .. })) => {
                        tracing::debug!(country = %country, check = %name, task = %stream.name(), "Check stopped by pool kill");
                        CheckOutcome::TimedOut
                    }
                    Ok(Err(error)) => {
                        tracing::error!(country = %country, check = %name, task = %stream.name(), error = %error, "{} failed to complete", name);
                        CheckOutcome::Failed {
                            error: error.to_string(),
                        }
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(country = %country, check = %name, task = %stream.name(), panic = %message, "{} failed to complete", name);
                        CheckOutcome::Failed {
                            error: format!("panicked: {}", message),
                        }
                    }
                };
                (name, outcome)
            });
        }

        let collect = async {
            while let Some(joined) = pool.join_next().await {
                match joined {
                    Ok((name, outcome)) => {
                        outcomes.insert(name, outcome);
                    }
                    Err(error) => {
                        tracing::error!(country, task = %stream.name(), error = %error, "Check worker lost");
                    }
                }
            }
        };
        if tokio::time::timeout(self.kill_after, collect).await.is_err() {
            tracing::error!(
                country,
                task = %stream.name(),
                kill_after_secs = self.kill_after.as_secs(),
                "Check pool killed"
            );
            cancelled.store(true, Ordering::Relaxed);
            pool.abort_all();
        }

        let summary = RunSummary {
            country: country.to_string(),
            stream: stream.name().to_string(),
            outcomes,
        };
        tracing::info!(
            country,
            task = %stream.name(),
            completed = summary.completed(),
            failed = summary.failed().len(),
            flags = summary.flags_posted(),
            "Checks finished"
        );
        summary
    }
}

/// Evaluate every candidate of one check. Returns the number of flags posted.
fn run_check(
    check: &dyn Check,
    country: &str,
    graph: &AssembledGraph,
    stream: &EventStream,
    filter: CandidateFilter,
    ticket_client: Option<&dyn TicketClient>,
    cancelled: &AtomicBool,
) -> Result<usize, CheckError> {
    let started = Instant::now();
    let ctx = CheckContext { country, graph };
    let mut scratch = CheckScratch::default();
    let mut uploads = Vec::new();
    let mut posted = 0usize;

    let complex: Vec<ComplexEntity> = check
        .finder()
        .map(|finder| finder.find(graph))
        .unwrap_or_default();
    let entities = graph
        .entities()
        .filter(|e| filter.accepts(graph, e))
        .map(Candidate::Entity);
    let complex = complex
        .iter()
        .filter(|c| filter.accepts_complex(graph, c))
        .map(Candidate::Complex);

    let result = entities.chain(complex).try_for_each(|candidate| -> Result<(), CheckError> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(CheckError::Cancelled {
                check: check.name().to_string(),
            });
        }
        if let Some(flag) = check.evaluate(&ctx, candidate, &mut scratch)? {
            if ticket_client.is_some() {
                uploads.push(flag.clone());
            }
            stream.post(CheckEvent::flag(flag));
            posted += 1;
        }
        Ok(())
    });
    check.reset(&mut scratch);
    result?;

    if let Some(client) = ticket_client {
        if let Err(error) = client.upload(check.name(), &uploads) {
            tracing::warn!(country, check = %check.name(), error = %error, "Ticket upload failed");
        }
    }
    stream.post(CheckEvent::MetricProduced {
        check_name: check.name().to_string(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    Ok(posted)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
