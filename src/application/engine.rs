//! Engine runtime.
//!
//! The engine owns the background tasks:
//! - one producer per [`SampleSource`], each on its own interval, feeding
//!   processed metrics into a bounded queue
//! - the ASH sampler, writing into its ring buffer
//! - the export cycle, draining the queue and the ring into one batch per
//!   interval and handing it to the [`ExportManager`]
//! - tracker maintenance (reset or decay)
//!
//! The queue never grows past its capacity. When it is full, new metrics
//! are dropped and counted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ash::{AshReader, AshSampler};
use crate::application::cardinality::{CardinalityLimiter, MaintenanceMode};
use crate::application::export::{ExportManager, ExportReport, TargetStatus};
use crate::application::health::{HealthProbe, HealthReport, ProbeTarget, RuntimeState};
use crate::application::metrics::Metrics;
use crate::application::pipeline::CollectionPipeline;
use crate::application::ports::{ExportAdapter, SampleSource};
use crate::domain::metric::{ExportBatch, UnifiedMetric};
use crate::domain::sample::RawSample;
use crate::error::ShutdownError;

/// Extra time allowed for tasks to wind down after in-flight exports are
/// abandoned.
const JOIN_SLACK: Duration = Duration::from_secs(1);

/// Scheduling settings for the engine's background tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub collection_interval: Duration,
    pub export_interval: Duration,
    pub maintenance_interval: Duration,
    pub maintenance_mode: MaintenanceMode,
    pub ash_interval: Duration,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(10),
            export_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(3600),
            maintenance_mode: MaintenanceMode::Reset,
            ash_interval: Duration::from_secs(1),
            queue_capacity: 10_000,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Producer {
    source: Arc<dyn SampleSource>,
    interval: Duration,
}

/// State shared between the engine handle and its tasks.
struct Core<A> {
    pipeline: CollectionPipeline,
    limiter: Arc<CardinalityLimiter>,
    exporter: ExportManager<A>,
    queue: mpsc::Sender<UnifiedMetric>,
    pending: Mutex<mpsc::Receiver<UnifiedMetric>>,
    ash: Option<AshReader>,
    metrics: Metrics,
    runtime: Arc<RuntimeState>,
}

impl<A: ExportAdapter> Core<A> {
    /// Process samples and queue the resulting metrics. Returns how many
    /// metrics were queued.
    fn ingest(&self, samples: &[RawSample]) -> usize {
        let mut queued = 0;
        let mut dropped = 0u64;
        for metric in self.pipeline.process_all(samples) {
            match self.queue.try_send(metric) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => dropped += 1,
            }
        }
        if dropped > 0 {
            self.metrics.record_metrics_dropped(dropped);
            tracing::warn!(dropped, "metric queue full, dropping metrics");
        }
        queued
    }

    fn drain(&self) -> Vec<UnifiedMetric> {
        let mut pending = self.pending.lock();
        let mut metrics = Vec::with_capacity(pending.len());
        while let Ok(metric) = pending.try_recv() {
            metrics.push(metric);
        }
        metrics
    }

    /// Whether queued metrics or ASH snapshots are waiting for export.
    fn has_buffered(&self) -> bool {
        !self.pending.lock().is_empty() || self.ash.as_ref().is_some_and(|ash| !ash.is_empty())
    }

    async fn export_cycle(&self) -> ExportReport {
        let mut metrics = self.drain();
        if let Some(ash) = &self.ash {
            for snapshot in ash.drain() {
                metrics.extend(snapshot.metrics);
            }
        }

        let cycle = self.runtime.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if metrics.is_empty() {
            tracing::debug!(cycle, "nothing to export");
            return ExportReport {
                cycle,
                batch_size: 0,
                targets: Vec::new(),
                elapsed: Duration::ZERO,
            };
        }

        let batch = ExportBatch::new(cycle, metrics);
        let report = self.exporter.export(&batch).await;
        tracing::info!(
            cycle,
            metrics = report.batch_size,
            delivered = report.count(TargetStatus::Delivered),
            partial = report.count(TargetStatus::Partial),
            failed = report.count(TargetStatus::Failed),
            skipped = report.count(TargetStatus::Skipped),
            abandoned = report.count(TargetStatus::Abandoned),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "export cycle finished"
        );
        *self.runtime.last_export.lock() = Some(report.clone());
        report
    }

    fn maintain(&self, mode: MaintenanceMode) {
        self.limiter.maintain(mode);
        tracing::debug!(?mode, "cardinality trackers maintained");
    }
}

/// The collection engine.
///
/// Built by [`EngineBuilder`](crate::infrastructure::builder::EngineBuilder)
/// from an [`EngineConfig`](crate::config::EngineConfig), or assembled by hand
/// from its parts with [`CollectionEngine::new`].
pub struct CollectionEngine<A> {
    core: Arc<Core<A>>,
    producers: Mutex<Vec<Producer>>,
    ash_sampler: Mutex<Option<AshSampler>>,
    schedule: Schedule,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    probe: HealthProbe,
}

impl<A> std::fmt::Debug for CollectionEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionEngine")
            .field("schedule", &self.schedule)
            .field("producers", &self.producers.lock().len())
            .field("tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl<A: ExportAdapter> CollectionEngine<A> {
    /// Assemble an engine.
    ///
    /// `shutdown` must be the token the export manager was created with, so
    /// that in-flight exports observe shutdown.
    pub fn new(
        pipeline: CollectionPipeline,
        exporter: ExportManager<A>,
        ash: Option<(AshSampler, AshReader)>,
        schedule: Schedule,
        shutdown: CancellationToken,
        metrics: Metrics,
    ) -> Self {
        let limiter = pipeline.shared_limiter();
        let (queue, pending) = mpsc::channel(schedule.queue_capacity.max(1));
        let (ash_sampler, ash_reader) = match ash {
            Some((sampler, reader)) => (Some(sampler), Some(reader)),
            None => (None, None),
        };
        let runtime = Arc::new(RuntimeState::default());

        let probe_targets = exporter
            .targets()
            .iter()
            .map(|t| ProbeTarget {
                name: t.name().into(),
                adapter: t.adapter().kind(),
                breaker: t.shared_breaker(),
            })
            .collect();
        let probe = HealthProbe::new(
            Arc::clone(&limiter),
            probe_targets,
            ash_reader.clone(),
            metrics.clone(),
            Arc::clone(&runtime),
        );

        Self {
            core: Arc::new(Core {
                pipeline,
                limiter,
                exporter,
                queue,
                pending: Mutex::new(pending),
                ash: ash_reader,
                metrics,
                runtime,
            }),
            producers: Mutex::new(Vec::new()),
            ash_sampler: Mutex::new(ash_sampler),
            schedule,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            probe,
        }
    }

    /// Register a sample source polled every collection interval.
    pub fn add_source(&self, source: Arc<dyn SampleSource>) {
        self.add_source_with_interval(source, self.schedule.collection_interval);
    }

    /// Register a sample source with its own polling interval.
    pub fn add_source_with_interval(&self, source: Arc<dyn SampleSource>, interval: Duration) {
        self.producers.lock().push(Producer { source, interval });
    }

    /// Spawn every background task. Sources registered later are not
    /// started. Calling this more than once has no effect.
    pub fn start(&self) {
        if self.core.runtime.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = Vec::new();
        for producer in self.producers.lock().drain(..) {
            tasks.push(self.spawn_producer(producer));
        }
        if let Some(sampler) = self.ash_sampler.lock().take() {
            tasks.push(sampler.spawn(self.schedule.ash_interval, self.shutdown.child_token()));
        }
        tasks.push(self.spawn_export_cycle());
        tasks.push(self.spawn_maintenance());

        tracing::info!(
            tasks = tasks.len(),
            export_interval_ms = self.schedule.export_interval.as_millis() as u64,
            "collection engine started"
        );
        self.tasks.lock().extend(tasks);
    }

    fn spawn_producer(&self, producer: Producer) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let name = producer.source.name().to_string();
            let mut ticker = tokio::time::interval(producer.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match producer.source.collect().await {
                            Ok(samples) => {
                                let queued = core.ingest(&samples);
                                tracing::trace!(source = %name, samples = samples.len(), queued, "collected");
                            }
                            Err(error) => {
                                core.metrics.record_source_error();
                                tracing::warn!(source = %name, %error, "sample collection failed, skipping tick");
                            }
                        }
                    }
                }
            }
            tracing::debug!(source = %name, "producer stopped");
        })
    }

    fn spawn_export_cycle(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let cancel = self.shutdown.clone();
        let period = self.schedule.export_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        core.export_cycle().await;
                    }
                }
            }

            // Flush what is left; in-flight calls are bounded by the grace period.
            if core.has_buffered() {
                core.export_cycle().await;
            }
            tracing::debug!("export cycle stopped");
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let cancel = self.shutdown.child_token();
        let period = self.schedule.maintenance_interval;
        let mode = self.schedule.maintenance_mode;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => core.maintain(mode),
                }
            }
        })
    }

    /// Track an extra task so that [`shutdown`](Self::shutdown) waits for it.
    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Process samples and queue their metrics for the next cycle.
    pub fn ingest(&self, samples: &[RawSample]) -> usize {
        self.core.ingest(samples)
    }

    /// Run one cycle immediately: process `samples`, then export everything
    /// queued together with any buffered ASH snapshots.
    pub async fn run_cycle(&self, samples: &[RawSample]) -> ExportReport {
        self.core.ingest(samples);
        self.core.export_cycle().await
    }

    /// Apply the configured maintenance to every tracker now.
    pub fn maintain(&self) {
        self.core.maintain(self.schedule.maintenance_mode);
    }

    pub fn health(&self) -> HealthReport {
        self.probe.report()
    }

    /// A cloneable handle for serving health from another task.
    pub fn health_probe(&self) -> HealthProbe {
        self.probe.clone()
    }

    pub fn limiter(&self) -> &CardinalityLimiter {
        &self.core.limiter
    }

    pub fn exporter(&self) -> &ExportManager<A> {
        &self.core.exporter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.core.metrics
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Token cancelled when the engine shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every task and wait for them.
    ///
    /// Producers stop at their next scheduling point. The export cycle
    /// flushes queued metrics once more; exports still running after the
    /// grace period are abandoned. Tasks that outlive the wait are aborted.
    ///
    /// # Errors
    /// Returns [`ShutdownError`] if a task had to be aborted or panicked.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown.cancel();
        self.core.runtime.running.store(false, Ordering::Release);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let deadline = Instant::now() + self.schedule.shutdown_grace + JOIN_SLACK;
        let mut timed_out = 0;
        let mut panicked = None;

        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => panicked = Some(err.to_string()),
                Ok(Err(_)) => {}
                Err(_) => {
                    task.abort();
                    timed_out += 1;
                }
            }
        }

        if let Some(message) = panicked {
            tracing::error!(%message, "engine task panicked");
            return Err(ShutdownError::TaskPanicked(message));
        }
        if timed_out > 0 {
            tracing::warn!(timed_out, "engine tasks aborted after shutdown grace period");
            return Err(ShutdownError::Timeout(timed_out));
        }
        tracing::info!("collection engine stopped");
        Ok(())
    }
}
