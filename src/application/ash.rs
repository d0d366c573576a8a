//! Active Session History.
//!
//! The ASH sampler periodically reads the set of connected sessions,
//! aggregates the active ones into low-cardinality gauges and writes one
//! snapshot per tick into a fixed-capacity ring buffer.
//!
//! The ring has exactly one writer, which never blocks: when the ring is
//! full the oldest snapshot is overwritten. Readers only ever observe
//! completed snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::cardinality::CardinalityLimiter;
use crate::application::metrics::Metrics;
use crate::application::ports::SessionSource;
use crate::domain::dimension::DimensionClass;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::metric::{names, Resource, UnifiedMetric};
use crate::domain::sample::ActiveSession;
use crate::error::{ConfigError, SourceError};

/// Label used when an active session is not waiting.
const ON_CPU: &str = "CPU";

/// Configuration for the ASH sampler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AshConfig {
    /// Sampling interval
    #[serde(with = "crate::config::duration_serde")]
    pub interval: Duration,
    /// Number of snapshots retained
    pub capacity: usize,
}

impl Default for AshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            capacity: 600,
        }
    }
}

impl AshConfig {
    /// # Errors
    /// Returns [`ConfigError`] if the interval or capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "ash.interval".to_string(),
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCount {
                field: "ash.capacity".to_string(),
            });
        }
        Ok(())
    }
}

/// Aggregated view of the active sessions at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AshSnapshot {
    pub sequence: u64,
    pub taken_at: SystemTime,
    /// Number of active (non-idle) sessions
    pub active_sessions: usize,
    pub metrics: Vec<UnifiedMetric>,
}

#[derive(Debug)]
struct Ring {
    slots: ArrayQueue<AshSnapshot>,
    written: AtomicU64,
    overwritten: AtomicU64,
}

/// Create a ring buffer holding at most `capacity` snapshots.
///
/// `capacity` is clamped to at least one.
pub fn ring(capacity: usize) -> (AshWriter, AshReader) {
    let ring = Arc::new(Ring {
        slots: ArrayQueue::new(capacity.max(1)),
        written: AtomicU64::new(0),
        overwritten: AtomicU64::new(0),
    });
    (
        AshWriter {
            ring: Arc::clone(&ring),
        },
        AshReader { ring },
    )
}

/// The single writing end of the ring. Not `Clone`.
#[derive(Debug)]
pub struct AshWriter {
    ring: Arc<Ring>,
}

impl AshWriter {
    /// Append a snapshot, returning the one it displaced if the ring was
    /// full.
    pub fn write(&self, snapshot: AshSnapshot) -> Option<AshSnapshot> {
        self.ring.written.fetch_add(1, Ordering::Relaxed);
        let displaced = self.ring.slots.force_push(snapshot);
        if displaced.is_some() {
            self.ring.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }
}

/// A reading end of the ring. Readers never block the writer.
#[derive(Debug, Clone)]
pub struct AshReader {
    ring: Arc<Ring>,
}

impl AshReader {
    /// Remove and return every completed snapshot, oldest first.
    pub fn drain(&self) -> Vec<AshSnapshot> {
        let mut out = Vec::with_capacity(self.ring.slots.len());
        while let Some(snapshot) = self.ring.slots.pop() {
            out.push(snapshot);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ring.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.capacity()
    }

    /// Total snapshots written.
    pub fn written(&self) -> u64 {
        self.ring.written.load(Ordering::Relaxed)
    }

    /// Snapshots lost to overwriting before any reader drained them.
    pub fn overwritten(&self) -> u64 {
        self.ring.overwritten.load(Ordering::Relaxed)
    }
}

/// Resolved dimensions shared by the sessions counted in one gauge.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SessionGroup {
    database: String,
    user: String,
    backend_type: String,
    state: String,
    wait_event_type: String,
    wait_event: String,
    fingerprint: Option<String>,
}

/// Periodic session sampler feeding the ring.
#[derive(Debug)]
pub struct AshSampler {
    source: Arc<dyn SessionSource>,
    writer: AshWriter,
    limiter: Arc<CardinalityLimiter>,
    resource: Arc<Resource>,
    metrics: Metrics,
    sequence: u64,
}

impl AshSampler {
    pub fn new(
        source: Arc<dyn SessionSource>,
        writer: AshWriter,
        limiter: Arc<CardinalityLimiter>,
        resource: Arc<Resource>,
        metrics: Metrics,
    ) -> Self {
        Self {
            source,
            writer,
            limiter,
            resource,
            metrics,
            sequence: 0,
        }
    }

    /// Take one snapshot and write it to the ring.
    ///
    /// # Errors
    /// Returns the source error; nothing is written in that case.
    pub async fn sample_once(&mut self) -> Result<(), SourceError> {
        let sessions = self.source.active_sessions().await?;
        let snapshot = self.aggregate(&sessions, SystemTime::now());
        if self.writer.write(snapshot).is_some() {
            self.metrics.record_ash_overwritten();
        }
        self.metrics.record_ash_snapshot();
        Ok(())
    }

    fn aggregate(&mut self, sessions: &[ActiveSession], taken_at: SystemTime) -> AshSnapshot {
        let mut groups: BTreeMap<SessionGroup, u64> = BTreeMap::new();
        let mut active = 0;

        for session in sessions.iter().filter(|s| s.state != "idle") {
            active += 1;
            *groups.entry(self.group_of(session)).or_insert(0) += 1;
        }

        let metrics = groups
            .into_iter()
            .map(|(group, count)| {
                let mut metric = UnifiedMetric::gauge(
                    names::ASH_ACTIVE_SESSIONS,
                    "{session}",
                    count as f64,
                    taken_at,
                    Arc::clone(&self.resource),
                )
                .with_attribute(DimensionClass::Database.attribute_key(), group.database)
                .with_attribute(DimensionClass::User.attribute_key(), group.user)
                .with_attribute(DimensionClass::BackendType.attribute_key(), group.backend_type)
                .with_attribute("db.session.state", group.state)
                .with_attribute("db.wait_event_type", group.wait_event_type)
                .with_attribute(DimensionClass::WaitEvent.attribute_key(), group.wait_event);
                if let Some(fingerprint) = group.fingerprint {
                    metric = metric
                        .with_attribute(DimensionClass::QueryFingerprint.attribute_key(), fingerprint);
                }
                metric
            })
            .collect();

        self.sequence += 1;
        AshSnapshot {
            sequence: self.sequence,
            taken_at,
            active_sessions: active,
            metrics,
        }
    }

    /// Resolve every dimension of `session` through the limiter.
    fn group_of(&self, session: &ActiveSession) -> SessionGroup {
        let resolve = |class: DimensionClass, value: &str| {
            self.limiter.resolve(&class, value, 1).to_string()
        };
        // Only the fingerprint id is kept, never the statement text.
        let fingerprint = session.query_text.as_deref().map(|text| {
            let hex = Fingerprint::of(text).hex();
            resolve(DimensionClass::QueryFingerprint, &hex)
        });

        SessionGroup {
            database: resolve(DimensionClass::Database, &session.database),
            user: resolve(DimensionClass::User, &session.user),
            backend_type: resolve(DimensionClass::BackendType, &session.backend_type),
            state: session.state.clone(),
            wait_event_type: session
                .wait_event_type
                .clone()
                .unwrap_or_else(|| ON_CPU.to_string()),
            wait_event: resolve(
                DimensionClass::WaitEvent,
                session.wait_event.as_deref().unwrap_or(ON_CPU),
            ),
            fingerprint,
        }
    }

    /// Sample every `interval` until `cancel` fires.
    pub fn spawn(mut self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.sample_once().await {
                            self.metrics.record_source_error();
                            tracing::warn!(%error, "active session sampling failed, skipping tick");
                        }
                    }
                }
            }
            tracing::debug!("ash sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cardinality::{CardinalityConfig, ClassLimits};
    use crate::domain::dimension::OTHER;
    use crate::domain::metric::AttributeValue;
    use crate::infrastructure::mocks::MockSessionSource;

    fn snapshot(sequence: u64) -> AshSnapshot {
        AshSnapshot {
            sequence,
            taken_at: SystemTime::now(),
            active_sessions: 0,
            metrics: Vec::new(),
        }
    }

    fn session(state: &str, wait_event: Option<&str>) -> ActiveSession {
        ActiveSession {
            database: "orders".to_string(),
            user: "app".to_string(),
            state: state.to_string(),
            wait_event_type: wait_event.map(|_| "Lock".to_string()),
            wait_event: wait_event.map(str::to_string),
            backend_type: "client backend".to_string(),
            query_text: None,
        }
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let (writer, reader) = ring(4);
        for i in 0..7 {
            writer.write(snapshot(i));
        }

        let sequences: Vec<u64> = reader.drain().iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5, 6]);
        assert_eq!(reader.overwritten(), 3);
        assert_eq!(reader.written(), 7);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (writer, reader) = ring(0);
        writer.write(snapshot(1));
        writer.write(snapshot(2));
        assert_eq!(reader.capacity(), 1);
        assert_eq!(reader.drain()[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_sampler_aggregates_active_sessions() {
        let source = MockSessionSource::new();
        source.push_ok(vec![
            session("active", None),
            session("active", None),
            session("active", Some("relation")),
            session("idle", None),
        ]);
        let (writer, reader) = ring(8);
        let metrics = Metrics::new();
        let mut sampler = AshSampler::new(
            Arc::new(source),
            writer,
            Arc::new(CardinalityLimiter::new(CardinalityConfig::default())),
            Arc::new(Resource::default()),
            metrics.clone(),
        );

        sampler.sample_once().await.unwrap();

        let snapshots = reader.drain();
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.active_sessions, 3);
        assert_eq!(snap.metrics.len(), 2);

        let on_cpu = snap
            .metrics
            .iter()
            .find(|m| m.attributes.get("db.wait_event") == Some(&AttributeValue::from(ON_CPU)))
            .unwrap();
        assert_eq!(on_cpu.value, 2.0);
        assert_eq!(metrics.snapshot().ash_snapshots, 1);
    }

    #[tokio::test]
    async fn test_sessions_grouped_by_user_backend_and_fingerprint() {
        let mut reporting = session("active", None);
        reporting.user = "reporting".to_string();
        reporting.query_text = Some("SELECT * FROM orders WHERE id = 7".to_string());
        let mut vacuum = session("active", None);
        vacuum.user = String::new();
        vacuum.backend_type = "autovacuum worker".to_string();

        let source = MockSessionSource::new();
        source.push_ok(vec![session("active", None), reporting, vacuum]);
        let (writer, reader) = ring(8);
        let limiter = Arc::new(CardinalityLimiter::new(
            CardinalityConfig::default()
                .with_class(DimensionClass::User, ClassLimits::new(1)),
        ));
        let mut sampler = AshSampler::new(
            Arc::new(source),
            writer,
            limiter,
            Arc::new(Resource::default()),
            Metrics::new(),
        );
        sampler.sample_once().await.unwrap();

        let snap = reader.drain().pop().unwrap();
        assert_eq!(snap.metrics.len(), 3);
        let with_user = |user: &str| {
            snap.metrics
                .iter()
                .filter(|m| m.attributes.get("db.user") == Some(&AttributeValue::from(user)))
                .collect::<Vec<_>>()
        };

        assert_eq!(with_user("app").len(), 1);
        assert_eq!(with_user(OTHER).len(), 2);

        let fingerprinted = snap
            .metrics
            .iter()
            .find(|m| m.attributes.contains_key("query.fingerprint"))
            .unwrap();
        let expected = Fingerprint::of("select * from orders where id = 1").hex();
        assert_eq!(
            fingerprinted.attributes.get("query.fingerprint"),
            Some(&AttributeValue::from(expected))
        );
        assert!(fingerprinted.attributes.values().all(|v| !v.to_string().contains("id = 7")));

        let backends: Vec<String> = snap
            .metrics
            .iter()
            .filter_map(|m| m.attributes.get("db.backend_type").map(AttributeValue::to_string))
            .collect();
        assert!(backends.contains(&"autovacuum worker".to_string()));
        assert!(backends.contains(&"client backend".to_string()));
    }

    #[tokio::test]
    async fn test_source_error_writes_nothing() {
        let source = MockSessionSource::new();
        source.push_err(SourceError::Unavailable("down".to_string()));
        let (writer, reader) = ring(8);
        let mut sampler = AshSampler::new(
            Arc::new(source),
            writer,
            Arc::new(CardinalityLimiter::new(CardinalityConfig::default())),
            Arc::new(Resource::default()),
            Metrics::new(),
        );

        assert!(sampler.sample_once().await.is_err());
        assert!(reader.is_empty());
    }
}
