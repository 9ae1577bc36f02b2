//! Per-phase progress reporting.
//!
//! The engine reports progress through a sink so callers can plug in a
//! terminal renderer without the engine knowing about terminals. The
//! default factory logs through `tracing`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Receives progress updates for a single phase.
pub trait ProgressSink: Send + Sync {
    /// Total document count, when known. May be called more than once as
    /// estimates firm up.
    fn set_total(&self, total: Option<u64>);
    /// Advances the processed count.
    fn inc(&self, n: u64);
    /// A human-readable status line.
    fn message(&self, text: &str);
}

/// Creates one sink per phase.
pub trait ProgressFactory: Send + Sync {
    /// Builds the sink for the named phase.
    fn for_phase(&self, phase: &str) -> Arc<dyn ProgressSink>;
}

/// Discards all progress.
pub struct NoOpProgress;

impl ProgressSink for NoOpProgress {
    fn set_total(&self, _total: Option<u64>) {}
    fn inc(&self, _n: u64) {}
    fn message(&self, _text: &str) {}
}

/// Logs progress through `tracing`.
pub struct TracingProgress {
    phase: String,
    processed: AtomicU64,
}

impl TracingProgress {
    /// Creates a sink for the named phase.
    #[must_use]
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            processed: AtomicU64::new(0),
        }
    }
}

impl ProgressSink for TracingProgress {
    fn set_total(&self, total: Option<u64>) {
        match total {
            Some(total) => debug!(phase = %self.phase, total, "expected document count"),
            None => debug!(phase = %self.phase, "document count unknown"),
        }
    }

    fn inc(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    fn message(&self, text: &str) {
        info!(phase = %self.phase, "{text}");
    }
}

/// Default factory: one [`TracingProgress`] per phase.
#[derive(Default)]
pub struct TracingProgressFactory;

impl ProgressFactory for TracingProgressFactory {
    fn for_phase(&self, phase: &str) -> Arc<dyn ProgressSink> {
        Arc::new(TracingProgress::new(phase))
    }
}

/// Records every update, for assertions in tests.
#[derive(Default)]
pub struct CollectingProgress {
    totals: Mutex<Vec<Option<u64>>>,
    processed: AtomicU64,
    messages: Mutex<Vec<String>>,
}

impl CollectingProgress {
    /// Totals received so far, in order.
    #[must_use]
    pub fn totals(&self) -> Vec<Option<u64>> {
        self.totals.lock().clone()
    }

    /// Documents counted so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Messages received so far, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl ProgressSink for CollectingProgress {
    fn set_total(&self, total: Option<u64>) {
        self.totals.lock().push(total);
    }

    fn inc(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::SeqCst);
    }

    fn message(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

/// Factory handing out shared [`CollectingProgress`] sinks keyed by phase
/// name, so tests can inspect them after the run.
#[derive(Default)]
pub struct CollectingProgressFactory {
    sinks: Mutex<HashMap<String, Arc<CollectingProgress>>>,
}

impl CollectingProgressFactory {
    /// The sink handed out for the named phase, if any.
    #[must_use]
    pub fn sink(&self, phase: &str) -> Option<Arc<CollectingProgress>> {
        self.sinks.lock().get(phase).cloned()
    }
}

impl ProgressFactory for CollectingProgressFactory {
    fn for_phase(&self, phase: &str) -> Arc<dyn ProgressSink> {
        let mut sinks = self.sinks.lock();
        let sink = sinks
            .entry(phase.to_string())
            .or_insert_with(|| Arc::new(CollectingProgress::default()));
        Arc::clone(sink) as Arc<dyn ProgressSink>
    }
}
