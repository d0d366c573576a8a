//! Self-observability counters for the collection engine.
//!
//! Provides counters about sampling, cardinality limiting and export
//! behavior for the health surface and for debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Counters tracking engine behavior.
///
/// All counters use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    samples_received: AtomicU64,
    samples_kept: AtomicU64,
    samples_dropped: AtomicU64,
    source_errors: AtomicU64,
    cardinality_overflows: AtomicU64,
    metrics_dropped: AtomicU64,
    batches_exported: AtomicU64,
    exports_delivered: AtomicU64,
    exports_failed: AtomicU64,
    exports_skipped: AtomicU64,
    ash_snapshots: AtomicU64,
    ash_overwritten: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sample_received(&self) {
        self.inner.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sample_kept(&self) {
        self.inner.samples_kept.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sampling drop. Drops are expected and never treated as
    /// failures.
    pub(crate) fn record_sample_dropped(&self) {
        self.inner.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_source_error(&self) {
        self.inner.source_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cardinality_overflow(&self) {
        self.inner
            .cardinality_overflows
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record metrics discarded because the batch queue was full.
    pub(crate) fn record_metrics_dropped(&self, count: u64) {
        self.inner.metrics_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_exported(&self) {
        self.inner.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_delivered(&self) {
        self.inner.exports_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_failed(&self) {
        self.inner.exports_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_skipped(&self) {
        self.inner.exports_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ash_snapshot(&self) {
        self.inner.ash_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ash_overwritten(&self) {
        self.inner.ash_overwritten.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples dropped by the sampler.
    pub fn samples_dropped(&self) -> u64 {
        self.inner.samples_dropped.load(Ordering::Relaxed)
    }

    /// Number of dimension values folded into `other`.
    pub fn cardinality_overflows(&self) -> u64 {
        self.inner.cardinality_overflows.load(Ordering::Relaxed)
    }

    /// Number of target exports skipped because a circuit was open.
    pub fn exports_skipped(&self) -> u64 {
        self.inner.exports_skipped.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSnapshot {
            samples_received: load(&inner.samples_received),
            samples_kept: load(&inner.samples_kept),
            samples_dropped: load(&inner.samples_dropped),
            source_errors: load(&inner.source_errors),
            cardinality_overflows: load(&inner.cardinality_overflows),
            metrics_dropped: load(&inner.metrics_dropped),
            batches_exported: load(&inner.batches_exported),
            exports_delivered: load(&inner.exports_delivered),
            exports_failed: load(&inner.exports_failed),
            exports_skipped: load(&inner.exports_skipped),
            ash_snapshots: load(&inner.ash_snapshots),
            ash_overwritten: load(&inner.ash_overwritten),
        }
    }
}

/// A point-in-time snapshot of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples_received: u64,
    pub samples_kept: u64,
    pub samples_dropped: u64,
    pub source_errors: u64,
    pub cardinality_overflows: u64,
    pub metrics_dropped: u64,
    pub batches_exported: u64,
    pub exports_delivered: u64,
    pub exports_failed: u64,
    pub exports_skipped: u64,
    pub ash_snapshots: u64,
    pub ash_overwritten: u64,
}

impl MetricsSnapshot {
    /// Fraction of received samples that were kept (0.0 to 1.0).
    ///
    /// Returns 0.0 if no samples have been received.
    pub fn keep_rate(&self) -> f64 {
        if self.samples_received == 0 {
            0.0
        } else {
            self.samples_kept as f64 / self.samples_received as f64
        }
    }

    /// Render every counter in the Prometheus text exposition format.
    ///
    /// Names are prefixed with `collection_engine_` and suffixed `_total`.
    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 12] = [
            ("samples_received", "Samples handed to the pipeline", self.samples_received),
            ("samples_kept", "Samples kept by the sampler", self.samples_kept),
            ("samples_dropped", "Samples dropped by the sampler", self.samples_dropped),
            ("source_errors", "Failed source collection ticks", self.source_errors),
            (
                "cardinality_overflows",
                "Dimension values folded into other",
                self.cardinality_overflows,
            ),
            ("metrics_dropped", "Metrics discarded on a full queue", self.metrics_dropped),
            ("batches_exported", "Batches handed to the export manager", self.batches_exported),
            ("exports_delivered", "Per-target exports delivered", self.exports_delivered),
            ("exports_failed", "Per-target exports failed", self.exports_failed),
            ("exports_skipped", "Per-target exports skipped on an open circuit", self.exports_skipped),
            ("ash_snapshots", "ASH snapshots written to the ring", self.ash_snapshots),
            ("ash_overwritten", "ASH snapshots overwritten before export", self.ash_overwritten),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP collection_engine_{name}_total {help}\n\
                 # TYPE collection_engine_{name}_total counter\n\
                 collection_engine_{name}_total {value}\n"
            ));
        }
        out
    }
}
