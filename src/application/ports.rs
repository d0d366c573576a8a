//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters and embedding applications implement
//! these ports.

use std::fmt::Debug;
use std::time::Instant;

use async_trait::async_trait;

use crate::domain::metric::ExportBatch;
use crate::domain::sample::{ActiveSession, RawSample};
use crate::error::{ExportError, SourceError};

/// Port for obtaining current time.
///
/// This abstraction allows the application layer to work with time
/// without depending on system clock implementation details.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Port for a periodic producer of raw samples (slow queries, blocking
/// sessions, statement statistics).
///
/// Each source runs on its own timer. An error skips the tick; it never
/// stops the source.
#[async_trait]
pub trait SampleSource: Send + Sync + Debug {
    /// Name used in logs and health output.
    fn name(&self) -> &str;

    /// Collect the samples observed since the previous call.
    async fn collect(&self) -> Result<Vec<RawSample>, SourceError>;
}

/// Port for reading the current set of database sessions.
#[async_trait]
pub trait SessionSource: Send + Sync + Debug {
    /// Snapshot the sessions that are currently connected.
    async fn active_sessions(&self) -> Result<Vec<ActiveSession>, SourceError>;
}

/// What an adapter managed to deliver for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Metrics accepted by the backend
    pub delivered_count: u64,
    /// Metrics the backend rejected
    pub failed_count: u64,
    /// Backend-supplied explanation for rejected metrics
    pub error_detail: Option<String>,
}

impl ExportOutcome {
    /// Every metric of a batch of `count` was delivered.
    pub fn delivered(count: u64) -> Self {
        Self {
            delivered_count: count,
            ..Self::default()
        }
    }
}

/// Port for delivering a batch to one telemetry backend.
///
/// `Ok` means the backend was reached, even if it rejected part of the
/// batch; `Err` is a transient failure that counts against the target's
/// circuit breaker.
#[async_trait]
pub trait ExportAdapter: Send + Sync + Debug + 'static {
    /// Short adapter kind, e.g. `json_lines`.
    fn kind(&self) -> &'static str;

    async fn export(&self, batch: &ExportBatch) -> Result<ExportOutcome, ExportError>;
}
