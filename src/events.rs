//! Per-task event stream.
//!
//! Each task owns one [`EventStream`] named `country_group`. Checks post
//! [`CheckEvent`]s concurrently; every registered [`Processor`] sees every
//! event. [`EventStream::complete`] delivers exactly one
//! [`CheckEvent::Shutdown`] to each processor, after which the stream is
//! closed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::Flag;

/// Events published while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckEvent {
    /// A check produced a flag.
    FlagProduced {
        /// Producing check.
        check_name: String,
        /// The flag.
        flag: Flag,
    },
    /// A check finished; elapsed wall time.
    MetricProduced {
        /// Check name.
        check_name: String,
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
    /// The stream is complete. Delivered once, last.
    Shutdown,
}

impl CheckEvent {
    /// Flag event shorthand.
    pub fn flag(flag: Flag) -> Self {
        Self::FlagProduced {
            check_name: flag.check_name.clone(),
            flag,
        }
    }
}

/// Subscriber of an event stream.
///
/// Called concurrently from several checks; implementations must be
/// thread-safe.
pub trait Processor: Send + Sync {
    /// Handle one event.
    fn process(&self, event: &CheckEvent);
}

/// Error type for stream operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Registration attempted after the first event.
    #[error("Stream {0} already started; processors must register before the task runs")]
    AlreadyStarted(String),
}

struct StreamState {
    processors: Vec<Arc<dyn Processor>>,
    closed: bool,
}

/// Observer list scoped to one task.
pub struct EventStream {
    name: String,
    state: RwLock<StreamState>,
    started: AtomicBool,
    posted: AtomicU64,
    dropped: AtomicU64,
}

impl EventStream {
    /// Create an open stream.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(StreamState {
                processors: Vec::new(),
                closed: false,
            }),
            started: AtomicBool::new(false),
            posted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a processor. Only allowed before the first event.
    pub fn register(&self, processor: Arc<dyn Processor>) -> Result<(), EventError> {
        let mut state = self.state.write();
        if self.started.load(Ordering::SeqCst) || state.closed {
            return Err(EventError::AlreadyStarted(self.name.clone()));
        }
        state.processors.push(processor);
        Ok(())
    }

    /// Number of registered processors.
    pub fn processor_count(&self) -> usize {
        self.state.read().processors.len()
    }

    /// Deliver an event to every processor.
    ///
    /// Safe under concurrent producers. Events posted after completion are
    /// dropped; posting `Shutdown` completes the stream.
    pub fn post(&self, event: CheckEvent) {
        if matches!(event, CheckEvent::Shutdown) {
            self.complete();
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        let state = self.state.read();
        if state.closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(stream = %self.name, "Event posted after completion dropped");
            return;
        }
        for processor in &state.processors {
            processor.process(&event);
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the stream and deliver `Shutdown` once. Later calls do nothing.
    pub fn complete(&self) {
        self.started.store(true, Ordering::SeqCst);
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.closed = true;
        for processor in &state.processors {
            processor.process(&CheckEvent::Shutdown);
        }
        tracing::debug!(
            stream = %self.name,
            posted = self.posted.load(Ordering::Relaxed),
            "Event stream complete"
        );
    }

    /// Whether the stream is closed.
    pub fn is_complete(&self) -> bool {
        self.state.read().closed
    }

    /// Events delivered so far (excluding `Shutdown`).
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Events dropped because they arrived after completion.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("name", &self.name)
            .field("processors", &self.processor_count())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CheckEvent>>,
    }

    impl Processor for Recorder {
        fn process(&self, event: &CheckEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn metric(name: &str) -> CheckEvent {
        CheckEvent::MetricProduced {
            check_name: name.to_string(),
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_single_shutdown_last() {
        let stream = EventStream::new("XYZ_10-1-1");
        let recorder = Arc::new(Recorder::default());
        stream.register(recorder.clone()).unwrap();

        stream.post(metric("a"));
        stream.complete();
        stream.complete();
        stream.post(metric("b"));
        stream.post(CheckEvent::Shutdown);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], CheckEvent::Shutdown);
        assert_eq!(stream.dropped(), 1);
    }

    #[test]
    fn test_register_after_start_rejected() {
        let stream = EventStream::new("XYZ_g");
        stream.post(metric("a"));
        let err = stream.register(Arc::new(Recorder::default())).unwrap_err();
        assert!(matches!(err, EventError::AlreadyStarted(_)));
    }

    #[test]
    fn test_concurrent_posts() {
        let stream = Arc::new(EventStream::new("XYZ_g"));
        let recorder = Arc::new(Recorder::default());
        stream.register(recorder.clone()).unwrap();

        std::thread::scope(|scope| {
            for t in 0..4 {
                let stream = Arc::clone(&stream);
                scope.spawn(move || {
                    for i in 0..50 {
                        stream.post(metric(&format!("{}-{}", t, i)));
                    }
                });
            }
        });
        stream.complete();

        let events = recorder.events.lock();
        assert_eq!(events.len(), 201);
        assert_eq!(events.last(), Some(&CheckEvent::Shutdown));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(metric("OrphanEdge")).unwrap();
        assert_eq!(json["type"], "metric_produced");
        assert_eq!(json["check_name"], "OrphanEdge");
    }
}
