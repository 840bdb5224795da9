//! Output sinks and commit protocol.
//!
//! Sinks are [`Processor`]s writing under `<output>/_temporary/<country>/<format>/`.
//! Once a country is complete, [`OutputLayout::commit`] renames its files into
//! `<output>/<format>/<country>/`. Commit is additive per file, so re-running a
//! job overwrites rather than duplicates. The temporary tree is removed
//! best-effort at the end.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregator::FlagContainer;
use crate::config::OutputFormat;
use crate::events::{CheckEvent, Processor};

/// Name of the staging directory under the output root.
pub const TEMPORARY_DIR: &str = "_temporary";

/// Error type for sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// File system failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A sink failed to write some events.
    #[error("{failures} write failures in {path}")]
    Incomplete {
        /// Output file.
        path: PathBuf,
        /// Number of failed writes.
        failures: u64,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
    move |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory layout of a job's output.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Output root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging root.
    pub fn temporary_root(&self) -> PathBuf {
        self.root.join(TEMPORARY_DIR)
    }

    /// Staging directory of one country and format.
    pub fn staging_dir(&self, country: &str, format: OutputFormat) -> PathBuf {
        self.temporary_root().join(country).join(format.dir_name())
    }

    /// Committed directory of one format and country.
    pub fn final_dir(&self, format: OutputFormat, country: &str) -> PathBuf {
        self.root.join(format.dir_name()).join(country)
    }

    /// Move a country's staged files into their final directories.
    ///
    /// Returns the committed paths, ordered.
    pub fn commit(&self, country: &str, formats: &[OutputFormat]) -> Result<Vec<PathBuf>, SinkError> {
        self.commit_excluding(country, formats, &BTreeSet::new())
    }

    /// Like [`commit`](Self::commit), leaving the staged files in `skip`
    /// behind for cleanup.
    pub fn commit_excluding(
        &self,
        country: &str,
        formats: &[OutputFormat],
        skip: &BTreeSet<PathBuf>,
    ) -> Result<Vec<PathBuf>, SinkError> {
        let mut committed = Vec::new();
        for format in formats {
            let staging = self.staging_dir(country, *format);
            let entries = match fs::read_dir(&staging) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&staging)(e)),
            };
            let target_dir = self.final_dir(*format, country);
            fs::create_dir_all(&target_dir).map_err(io_error(&target_dir))?;

            for entry in entries {
                let entry = entry.map_err(io_error(&staging))?;
                let from = entry.path();
                if skip.contains(&from) {
                    continue;
                }
                let to = target_dir.join(entry.file_name());
                fs::rename(&from, &to).map_err(io_error(&from))?;
                committed.push(to);
            }
        }
        committed.sort();
        tracing::info!(country, files = committed.len(), "Committed output");
        Ok(committed)
    }

    /// Remove the staging tree. Failures are logged, not returned.
    pub fn cleanup(&self) {
        let temporary = self.temporary_root();
        match fs::remove_dir_all(&temporary) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %temporary.display(), error = %e, "Clean up failed");
            }
        }
    }
}

/// Lazily opened, line-oriented output file.
struct LineFile {
    path: PathBuf,
    header: Option<&'static str>,
    writer: Mutex<Option<BufWriter<File>>>,
    lines: AtomicU64,
    failures: AtomicU64,
}

impl LineFile {
    fn new(path: PathBuf, header: Option<&'static str>) -> Self {
        Self {
            path,
            header,
            writer: Mutex::new(None),
            lines: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&self.path)?);
        if let Some(header) = self.header {
            writeln!(writer, "{}", header)?;
        }
        Ok(writer)
    }

    fn write_line(&self, line: &str) {
        let mut guard = self.writer.lock();
        let result = match guard.as_mut() {
            Some(writer) => writeln!(writer, "{}", line),
            None => self.open().and_then(|mut writer| {
                writeln!(writer, "{}", line)?;
                *guard = Some(writer);
                Ok(())
            }),
        };
        match result {
            Ok(()) => {
                self.lines.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn close(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                self.record_failure(e);
            }
        }
    }

    fn record_failure(&self, error: std::io::Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(path = %self.path.display(), error = %error, "Sink write failed");
    }

    fn finish(&self) -> Result<u64, SinkError> {
        self.close();
        match self.failures.load(Ordering::Relaxed) {
            0 => Ok(self.lines.load(Ordering::Relaxed)),
            failures => Err(SinkError::Incomplete {
                path: self.path.clone(),
                failures,
            }),
        }
    }
}

/// Writes `flag_produced` events as JSON lines.
///
/// The file is created on the first flag, so a country without flags
/// produces no file.
pub struct FlagFileProcessor {
    file: LineFile,
}

impl FlagFileProcessor {
    /// Sink writing `<staging>/<name>.jsonl` for `country`.
    pub fn new(layout: &OutputLayout, country: &str, name: &str) -> Self {
        let path = layout
            .staging_dir(country, OutputFormat::Flags)
            .join(format!("{}.jsonl", name));
        Self {
            file: LineFile::new(path, None),
        }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Lines written so far.
    pub fn written(&self) -> u64 {
        self.file.lines.load(Ordering::Relaxed)
    }

    /// Render a merged container and close the file.
    ///
    /// Returns the number of flags written.
    pub fn render(&self, container: &FlagContainer) -> Result<u64, SinkError> {
        for event in container.reconstruct_events() {
            self.process(&event);
        }
        self.process(&CheckEvent::Shutdown);
        self.file.finish()
    }
}

impl Processor for FlagFileProcessor {
    fn process(&self, event: &CheckEvent) {
        match event {
            CheckEvent::FlagProduced { .. } => match serde_json::to_string(event) {
                Ok(line) => self.file.write_line(&line),
                Err(e) => {
                    self.file.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(path = %self.file.path.display(), error = %e, "Flag encoding failed");
                }
            },
            CheckEvent::Shutdown => self.file.close(),
            CheckEvent::MetricProduced { .. } => {}
        }
    }
}

/// Writes `metric_produced` events as CSV rows `check_name,elapsed_ms`.
pub struct MetricFileProcessor {
    file: LineFile,
}

impl MetricFileProcessor {
    /// CSV header row.
    pub const HEADER: &'static str = "check_name,elapsed_ms";

    /// Sink writing `<staging>/<name>.csv` for `country`.
    pub fn new(layout: &OutputLayout, country: &str, name: &str) -> Self {
        let path = layout
            .staging_dir(country, OutputFormat::Metrics)
            .join(format!("{}.csv", name));
        Self {
            file: LineFile::new(path, Some(Self::HEADER)),
        }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Rows written so far.
    pub fn written(&self) -> u64 {
        self.file.lines.load(Ordering::Relaxed)
    }

    /// Close the file and report failures.
    pub fn finish(&self) -> Result<u64, SinkError> {
        self.file.finish()
    }
}

impl Processor for MetricFileProcessor {
    fn process(&self, event: &CheckEvent) {
        match event {
            CheckEvent::MetricProduced {
                check_name,
                elapsed_ms,
            } => self
                .file
                .write_line(&format!("{},{}", csv_field(check_name), elapsed_ms)),
            CheckEvent::Shutdown => self.file.close(),
            CheckEvent::FlagProduced { .. } => {}
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
