//! # collection-engine
//!
//! Bounded-cardinality telemetry collection for relational databases.
//!
//! The engine turns raw observations (slow queries, blocking sessions,
//! session snapshots) into dimensional metrics and delivers them to one or
//! more telemetry backends. Three guarantees shape everything it does:
//!
//! - **Bounded cardinality.** Every dimension class tracks at most
//!   `max_tracked` distinct values. Values that do not fit are reported as
//!   `"other"`, so the number of series a backend sees never grows without
//!   bound.
//! - **No raw statement text.** Query text is normalized before it is used
//!   anywhere: literals become `?`, comments disappear and IN-lists collapse.
//!   Only the normalized form and its fingerprint reach exported metrics.
//! - **Isolated backends.** Each export target has its own timeout, retry
//!   budget and circuit breaker. A slow or failing backend never delays or
//!   blocks delivery to the others.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use collection_engine::config::EngineConfig;
//! use collection_engine::CollectionEngine;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_toml_str(r#"
//!     [sampler]
//!     hard_threshold = "1s"
//!     default_rate = 0.2
//!
//!     [cardinality.classes.query_fingerprint]
//!     max_tracked = 500
//!
//!     [[export.targets]]
//!     name = "collector"
//!     kind = "otlp"
//!     endpoint = "http://localhost:4318"
//!
//!     [[export.targets]]
//!     name = "archive"
//!     kind = "json_lines"
//!     path = "/var/log/db-metrics.jsonl"
//!
//!     [health]
//!     listen = "127.0.0.1:9187"
//! "#)?;
//!
//! let engine = CollectionEngine::builder(config)
//!     // .with_source(Arc::new(MySlowQuerySource::new(pool)))
//!     // .with_session_source(Arc::new(MySessionSource::new(pool)))
//!     .start()
//!     .await?;
//!
//! // ... on SIGTERM:
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Sources are the embedding application's job: implement
//! [`SampleSource`](application::ports::SampleSource) for periodic producers
//! and [`SessionSource`](application::ports::SessionSource) for Active
//! Session History.
//!
//! ## Fingerprinting
//!
//! ```rust
//! use collection_engine::domain::fingerprint::fingerprint;
//!
//! let a = fingerprint("SELECT * FROM users WHERE id = 42");
//! let b = fingerprint("select *  from users where id = 7 -- retry");
//! assert_eq!(a, b);
//! assert_eq!(a.normalized(), "select * from users where id = ?");
//! ```
//!
//! ## Cardinality Limiting
//!
//! Each dimension class (query fingerprint, table, user, statement type,
//! database, wait event, or any custom class) has an independent
//! Space-Saving tracker. When a new value arrives and the class is full, it
//! replaces the lightest tracked value only if its own weight exceeds that
//! value's count; otherwise it is folded into `"other"`. Weights are sample
//! durations in milliseconds, so expensive queries keep their identity.
//! Allowlisted values always pass through and do not count toward the bound.
//!
//! ```rust
//! use collection_engine::application::cardinality::{
//!     Admission, CardinalityConfig, CardinalityLimiter, ClassLimits,
//! };
//! use collection_engine::domain::dimension::DimensionClass;
//!
//! let limiter = CardinalityLimiter::new(
//!     CardinalityConfig::default()
//!         .with_class(DimensionClass::Table, ClassLimits::new(2).with_allowlist(["pg_class"])),
//! );
//! let table = DimensionClass::Table;
//!
//! assert_eq!(limiter.admit(&table, "orders", 10), Admission::Tracked);
//! assert_eq!(limiter.admit(&table, "items", 10), Admission::Tracked);
//! assert_eq!(limiter.admit(&table, "audit", 1), Admission::Overflow);
//! assert_eq!(limiter.admit(&table, "pg_class", 1), Admission::Allowlisted);
//! ```
//!
//! Trackers are reset (or decayed) on a configurable interval so that the
//! tracked set follows the workload.
//!
//! ## Adaptive Sampling
//!
//! Samples slower than the hard threshold are always kept. Otherwise the
//! first matching rule decides (keep, drop, or keep with probability `p`),
//! falling back to the default rate. With a seed configured the decisions
//! are reproducible.
//!
//! ## Export
//!
//! Every export cycle drains the metric queue and the ASH ring buffer into
//! one immutable batch and delivers it to all targets in parallel. Failures
//! are retried with capped exponential backoff and count toward the
//! target's circuit breaker. An open breaker skips the target until its
//! cooldown elapses, after which one trial call decides whether it closes
//! again or re-opens with a longer cooldown.
//!
//! ## Observability
//!
//! The engine logs through [`tracing`] and never installs a subscriber.
//! [`CollectionEngine::health`] returns a serializable [`HealthReport`] with
//! tracker occupancy, breaker states and self-metrics; with the
//! `health-server` feature (on by default) it is also served at
//! `GET /health`, next to a `GET /ready` probe and a Prometheus-format
//! `GET /metrics` page of the engine's own counters.
//!
//! ## Features
//!
//! - `health-server` (default): HTTP health endpoint via `axum`
//! - `test-helpers`: mock sources, adapters, clock and a capturing tracing
//!   layer for integration tests

pub mod config;
pub mod error;

// Domain layer - pure data and algorithms
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    dimension::{DimensionClass, DimensionKey, OTHER},
    fingerprint::{fingerprint, normalize, Fingerprint},
    metric::{AttributeValue, ExportBatch, MetricKind, Resource, UnifiedMetric},
    sample::{ActiveSession, RawSample, SampleKind},
    sampling::{Condition, Operator, RuleAction, SamplingRule},
};

pub use application::{
    ash::{AshConfig, AshReader, AshSnapshot},
    cardinality::{Admission, CardinalityConfig, CardinalityLimiter, ClassLimits, MaintenanceMode},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    engine::{CollectionEngine, Schedule},
    export::{ExportManager, ExportReport, ExportTarget, RetryPolicy, TargetReport, TargetStatus},
    health::{HealthProbe, HealthReport, HealthStatus},
    metrics::{Metrics, MetricsSnapshot},
    pipeline::CollectionPipeline,
    ports::{Clock, ExportAdapter, ExportOutcome, SampleSource, SessionSource},
    sampler::{AdaptiveSampler, SamplerConfig},
};

pub use config::EngineConfig;

pub use error::{
    CircuitOpenError, ConfigError, ExportError, SampleError, ShutdownError, SourceError,
};

pub use infrastructure::{
    adapters::{Adapter, AdapterConfig, JsonLinesAdapter, OtlpAdapter, TargetConfig},
    builder::{BuildError, EngineBuilder},
    clock::SystemClock,
};
