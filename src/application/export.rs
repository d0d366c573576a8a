//! Export fan-out.
//!
//! The export manager delivers one batch to every configured target in
//! parallel and reports a per-target outcome. Targets are isolated from each
//! other: each call runs in its own task with its own timeout, retry budget
//! and circuit breaker, and the manager waits for all of them.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::application::metrics::Metrics;
use crate::application::ports::{ExportAdapter, ExportOutcome};
use crate::domain::metric::ExportBatch;
use crate::error::{CircuitOpenError, ConfigError, ExportError};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "crate::config::duration_serde")]
    pub base_delay: Duration,
    /// Upper bound on any delay
    #[serde(with = "crate::config::duration_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// # Errors
    /// Returns [`ConfigError::ZeroCount`] if no attempt is allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroCount {
                field: "export.retry.max_attempts".to_string(),
            });
        }
        Ok(())
    }
}

/// One export destination with its own breaker and timeout.
#[derive(Debug)]
pub struct ExportTarget<A> {
    name: Arc<str>,
    adapter: Arc<A>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl<A> Clone for ExportTarget<A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            adapter: Arc::clone(&self.adapter),
            breaker: Arc::clone(&self.breaker),
            timeout: self.timeout,
        }
    }
}

impl<A: ExportAdapter> ExportTarget<A> {
    pub fn new(name: impl Into<Arc<str>>, adapter: A, breaker: CircuitBreaker, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            adapter: Arc::new(adapter),
            breaker: Arc::new(breaker),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn shared_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }
}

/// Terminal status of one target for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// The backend accepted every metric
    Delivered,
    /// The backend was reached but rejected some metrics
    Partial,
    /// Every attempt failed
    Failed,
    /// The circuit was open; the backend was not contacted
    Skipped,
    /// Shutdown cut the call short
    Abandoned,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Delivered => "delivered",
            TargetStatus::Partial => "partial",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
            TargetStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Outcome for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub status: TargetStatus,
    pub delivered_count: u64,
    pub failed_count: u64,
    pub error_detail: Option<String>,
    pub attempts: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl TargetReport {
    fn new(target: &str, status: TargetStatus) -> Self {
        Self {
            target: target.to_string(),
            status,
            delivered_count: 0,
            failed_count: 0,
            error_detail: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Aggregate outcome of one batch across all targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub cycle: u64,
    pub batch_size: u64,
    pub targets: Vec<TargetReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ExportReport {
    /// Report for the named target.
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == name)
    }

    /// Number of targets with the given status.
    pub fn count(&self, status: TargetStatus) -> usize {
        self.targets.iter().filter(|t| t.status == status).count()
    }

    /// Whether at least one target received the batch.
    pub fn any_delivered(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t.status, TargetStatus::Delivered | TargetStatus::Partial))
    }
}

/// Fans batches out to every target.
#[derive(Debug)]
pub struct ExportManager<A> {
    targets: Vec<ExportTarget<A>>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    metrics: Metrics,
}

impl<A: ExportAdapter> ExportManager<A> {
    pub fn new(
        targets: Vec<ExportTarget<A>>,
        retry: RetryPolicy,
        shutdown: CancellationToken,
        shutdown_grace: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            targets,
            retry,
            shutdown,
            shutdown_grace,
            metrics,
        }
    }

    pub fn targets(&self) -> &[ExportTarget<A>] {
        &self.targets
    }

    /// Breaker state for every target, in configuration order.
    pub fn circuit_states(&self) -> Vec<(String, CircuitSnapshot)> {
        self.targets
            .iter()
            .map(|t| (t.name.to_string(), t.breaker.snapshot()))
            .collect()
    }

    /// Deliver `batch` to every target and wait for all of them.
    ///
    /// Never fails as a whole: each target's result is reported separately.
    /// Once shutdown is signalled, calls still running after the grace
    /// period are aborted and reported as abandoned.
    pub async fn export(&self, batch: &ExportBatch) -> ExportReport {
        let started = Instant::now();
        let mut reports: Vec<Option<TargetReport>> = vec![None; self.targets.len()];
        let mut handles: Vec<(usize, JoinHandle<TargetReport>)> = Vec::new();

        for (index, target) in self.targets.iter().enumerate() {
            if !target.breaker.allow_request() {
                let skipped = CircuitOpenError {
                    target: target.name.to_string(),
                };
                tracing::debug!(export_target = %target.name, cycle = batch.cycle(), "{skipped}, skipping");
                let mut report = TargetReport::new(&target.name, TargetStatus::Skipped);
                report.error_detail = Some(skipped.to_string());
                reports[index] = Some(report);
                continue;
            }
            let task = deliver(
                target.clone(),
                batch.clone(),
                self.retry.clone(),
                self.shutdown.clone(),
            );
            handles.push((index, tokio::spawn(task)));
        }

        let abort_handles: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();
        let shutdown = self.shutdown.clone();
        let grace = self.shutdown_grace;
        let watchdog = async move {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
            for handle in abort_handles {
                handle.abort();
            }
        };
        tokio::pin!(watchdog);
        let mut fired = false;

        for (index, mut handle) in handles {
            let joined = loop {
                tokio::select! {
                    joined = &mut handle => break joined,
                    _ = &mut watchdog, if !fired => fired = true,
                }
            };
            let target = &self.targets[index];
            let report = match joined {
                Ok(report) => report,
                Err(err) if err.is_cancelled() => {
                    target.breaker.release_trial();
                    tracing::warn!(export_target = %target.name, "export abandoned at shutdown");
                    TargetReport::new(&target.name, TargetStatus::Abandoned)
                }
                Err(err) => {
                    target.breaker.record_failure();
                    let error = ExportError::Aborted(err.to_string());
                    tracing::error!(export_target = %target.name, %error, "export task panicked");
                    let mut report = TargetReport::new(&target.name, TargetStatus::Failed);
                    report.failed_count = batch.len() as u64;
                    report.error_detail = Some(error.to_string());
                    report
                }
            };
            reports[index] = Some(report);
        }

        let targets: Vec<TargetReport> = reports.into_iter().flatten().collect();
        for report in &targets {
            match report.status {
                TargetStatus::Delivered | TargetStatus::Partial => {
                    self.metrics.record_export_delivered()
                }
                TargetStatus::Failed => self.metrics.record_export_failed(),
                TargetStatus::Skipped => self.metrics.record_export_skipped(),
                TargetStatus::Abandoned => {}
            }
        }
        self.metrics.record_batch_exported();

        ExportReport {
            cycle: batch.cycle(),
            batch_size: batch.len() as u64,
            targets,
            elapsed: started.elapsed(),
        }
    }
}

/// Run one target's attempts for one batch.
async fn deliver<A: ExportAdapter>(
    target: ExportTarget<A>,
    batch: ExportBatch,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) -> TargetReport {
    let started = Instant::now();
    let mut report = TargetReport::new(&target.name, TargetStatus::Failed);
    let mut last_error: Option<ExportError> = None;

    loop {
        report.attempts += 1;
        let result = match tokio::time::timeout(target.timeout, target.adapter.export(&batch)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout(target.timeout)),
        };

        match result {
            Ok(outcome) => {
                target.breaker.record_success();
                return finish_delivered(report, outcome, started);
            }
            Err(error) => {
                target.breaker.record_failure();
                tracing::warn!(
                    export_target = %target.name,
                    adapter = target.adapter.kind(),
                    cycle = batch.cycle(),
                    attempt = report.attempts,
                    kind = error.kind(),
                    %error,
                    "export attempt failed"
                );
                let permanent = !error.is_retryable();
                last_error = Some(error);
                if permanent {
                    tracing::debug!(export_target = %target.name, "permanent rejection, not retrying");
                    break;
                }
            }
        }

        if report.attempts >= retry.max_attempts {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(retry.delay_after(report.attempts)) => {}
        }
        if !target.breaker.allow_request() {
            tracing::debug!(export_target = %target.name, "circuit opened, no further retries");
            break;
        }
    }

    report.failed_count = batch.len() as u64;
    report.error_detail = last_error.map(|e| e.to_string());
    report.elapsed = started.elapsed();
    report
}

fn finish_delivered(mut report: TargetReport, outcome: ExportOutcome, started: Instant) -> TargetReport {
    report.status = if outcome.failed_count == 0 {
        TargetStatus::Delivered
    } else {
        TargetStatus::Partial
    };
    report.delivered_count = outcome.delivered_count;
    report.failed_count = outcome.failed_count;
    report.error_detail = outcome.error_detail;
    report.elapsed = started.elapsed();
    report
}
