//! Read-only health surface.
//!
//! A [`HealthProbe`] is a cheap, cloneable view over the engine's shared
//! state. It never mutates anything, so it can be handed to an HTTP handler
//! or polled from another task without coordination.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::application::ash::AshReader;
use crate::application::cardinality::CardinalityLimiter;
use crate::application::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::application::export::ExportReport;
use crate::application::metrics::{Metrics, MetricsSnapshot};
use crate::domain::dimension::DimensionClass;

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every circuit is closed
    Healthy,
    /// At least one target is open or probing
    Degraded,
    /// Every target is open
    Unhealthy,
}

/// Cardinality state of one dimension class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassHealth {
    pub class: DimensionClass,
    pub tracked: usize,
    pub max_tracked: usize,
    pub allowlisted: usize,
    pub other_weight: u64,
    pub overflows: u64,
    pub evictions: u64,
}

/// Breaker state of one export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub name: String,
    pub adapter: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AshHealth {
    pub buffered: usize,
    pub capacity: usize,
    pub written: u64,
    pub overwritten: u64,
}

/// Everything the health endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub ready: bool,
    pub cycles: u64,
    pub classes: Vec<ClassHealth>,
    pub targets: Vec<TargetHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ash: Option<AshHealth>,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_export: Option<ExportReport>,
}

/// Lifecycle state shared by the engine and its probes.
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) running: AtomicBool,
    pub(crate) cycles: AtomicU64,
    pub(crate) last_export: Mutex<Option<ExportReport>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProbeTarget {
    pub(crate) name: Arc<str>,
    pub(crate) adapter: &'static str,
    pub(crate) breaker: Arc<CircuitBreaker>,
}

/// Cloneable read-only view of engine health.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    limiter: Arc<CardinalityLimiter>,
    targets: Arc<[ProbeTarget]>,
    ash: Option<AshReader>,
    metrics: Metrics,
    runtime: Arc<RuntimeState>,
}

impl HealthProbe {
    pub(crate) fn new(
        limiter: Arc<CardinalityLimiter>,
        targets: Vec<ProbeTarget>,
        ash: Option<AshReader>,
        metrics: Metrics,
        runtime: Arc<RuntimeState>,
    ) -> Self {
        Self {
            limiter,
            targets: targets.into(),
            ash,
            metrics,
            runtime,
        }
    }

    /// Whether the engine's background tasks are running.
    pub fn is_ready(&self) -> bool {
        self.runtime.running.load(Ordering::Acquire)
    }

    pub fn report(&self) -> HealthReport {
        let classes = self
            .limiter
            .snapshot()
            .into_iter()
            .map(|c| ClassHealth {
                class: c.class,
                tracked: c.tracked,
                max_tracked: c.max_tracked,
                allowlisted: c.allowlisted,
                other_weight: c.other_weight,
                overflows: c.overflows,
                evictions: c.evictions,
            })
            .collect();

        let targets: Vec<TargetHealth> = self
            .targets
            .iter()
            .map(|t| {
                let snap = t.breaker.snapshot();
                TargetHealth {
                    name: t.name.to_string(),
                    adapter: t.adapter,
                    state: snap.state,
                    consecutive_failures: snap.consecutive_failures,
                    cooldown_ms: snap.cooldown_ms,
                }
            })
            .collect();

        let ash = self.ash.as_ref().map(|reader| AshHealth {
            buffered: reader.len(),
            capacity: reader.capacity(),
            written: reader.written(),
            overwritten: reader.overwritten(),
        });

        HealthReport {
            status: status_of(&targets),
            ready: self.is_ready(),
            cycles: self.runtime.cycles.load(Ordering::Relaxed),
            classes,
            targets,
            ash,
            metrics: self.metrics.snapshot(),
            last_export: self.runtime.last_export.lock().clone(),
        }
    }
}

fn status_of(targets: &[TargetHealth]) -> HealthStatus {
    let open = targets
        .iter()
        .filter(|t| t.state == CircuitState::Open)
        .count();
    if !targets.is_empty() && open == targets.len() {
        HealthStatus::Unhealthy
    } else if targets.iter().any(|t| t.state != CircuitState::Closed) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
