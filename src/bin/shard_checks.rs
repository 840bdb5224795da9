//! Sharded Checks Binary
//!
//! Runs integrity checks over every shard of the requested countries and
//! writes the merged per-country flags.
//!
//! ## Configuration
//!
//! A JSON [`JobConfig`] file (optional) provides the base settings; flags
//! and environment variables override individual fields:
//! - `SHARD_CHECKS_CONFIG`: configuration file
//! - `SHARD_CHECKS_COUNTRIES`: comma separated ISO3 codes
//! - `SHARD_CHECKS_INPUT` / `SHARD_CHECKS_OUTPUT`: fragment root and output root
//! - `RUST_LOG`: Log level filter (default: sharded_checks=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin shard_checks --features cli -- \
//!     --countries XYZ,ABC --input atlas/ --output out/ --strategy deferred
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use sharded_checks::{
    CheckJob, Distance, GroupingMode, JobConfig, LoadingStrategy, OutputFormat,
};

#[derive(Parser, Debug)]
#[command(name = "shard_checks")]
#[command(about = "Run sharded integrity checks and write merged per-country flags")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "SHARD_CHECKS_CONFIG")]
    config: Option<PathBuf>,

    /// Countries to check (ISO3)
    #[arg(long, env = "SHARD_CHECKS_COUNTRIES", value_delimiter = ',')]
    countries: Vec<String>,

    /// Fragment root directory
    #[arg(long, env = "SHARD_CHECKS_INPUT")]
    input: Option<PathBuf>,

    /// Output root directory
    #[arg(long, env = "SHARD_CHECKS_OUTPUT")]
    output: Option<PathBuf>,

    /// Alternate sharding file (JSON array of shard names)
    #[arg(long, env = "SHARD_CHECKS_SHARDING")]
    sharding: Option<PathBuf>,

    /// Output formats (flags, metrics)
    #[arg(long, value_delimiter = ',')]
    formats: Vec<OutputFormat>,

    /// Boundary expansion distance in kilometers
    #[arg(long)]
    buffer_km: Option<f64>,

    /// Loader strategy: eager, deferred or deferred+relations
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<LoadingStrategy>,

    /// Group shards into bounded tasks instead of one task per shard
    #[arg(long)]
    bounded_groups: bool,

    /// Maximum shards a task may load
    #[arg(long)]
    max_shard_load: Option<usize>,

    /// Write the job report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

fn parse_strategy(s: &str) -> Result<LoadingStrategy, String> {
    match s {
        "eager" => Ok(LoadingStrategy::Eager),
        "deferred" => Ok(LoadingStrategy::Deferred {
            relation_aware: false,
        }),
        "deferred+relations" => Ok(LoadingStrategy::Deferred {
            relation_aware: true,
        }),
        other => Err(format!("unknown strategy {}", other)),
    }
}

impl Args {
    fn into_config(self) -> Result<(JobConfig, Option<PathBuf>), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => JobConfig::from_file(path)?,
            None => JobConfig::default(),
        };
        if !self.countries.is_empty() {
            config.countries = self.countries;
        }
        if let Some(input) = self.input {
            config.input = input;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(sharding) = self.sharding {
            config.sharding = Some(sharding);
        }
        if !self.formats.is_empty() {
            config.output_formats = self.formats;
        }
        if let Some(km) = self.buffer_km {
            config.loader.buffer_distance = Distance::kilometers(km);
        }
        if let Some(strategy) = self.strategy {
            config.loader.strategy = strategy;
        }
        if self.bounded_groups {
            config.grouping = GroupingMode::Bounded;
        }
        if let Some(max) = self.max_shard_load {
            config.max_shard_load = max;
        }
        config.validate()?;
        Ok((config, self.report))
    }
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shard_checks=info,sharded_checks=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");
    info!(version = version, build_sha = build_sha, "Starting sharded checks");

    let (config, report_path) = Args::parse().into_config()?;
    let report = match CheckJob::new(config).run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Check job failed");
            return Err(e.into());
        }
    };

    let rendered = serde_json::to_string_pretty(&report)?;
    match report_path {
        Some(path) => {
            std::fs::write(&path, rendered)?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", rendered),
    }

    Ok(())
}
