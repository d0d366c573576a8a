//! Engine construction from configuration.
//!
//! [`EngineBuilder`] validates an [`EngineConfig`], creates the configured
//! adapters and wires every component together:
//!
//! ```no_run
//! use collection_engine::config::EngineConfig;
//! use collection_engine::infrastructure::builder::EngineBuilder;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_toml_str(r#"
//!     [[export.targets]]
//!     name = "stdout"
//!     kind = "json_lines"
//! "#)?;
//!
//! let engine = EngineBuilder::new(config).start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::application::ash::{ring, AshSampler};
use crate::application::cardinality::CardinalityLimiter;
use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::engine::{CollectionEngine, Schedule};
use crate::application::export::{ExportManager, ExportTarget};
use crate::application::metrics::Metrics;
use crate::application::pipeline::CollectionPipeline;
use crate::application::ports::{Clock, SampleSource, SessionSource};
use crate::application::sampler::AdaptiveSampler;
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::infrastructure::adapters::Adapter;
use crate::infrastructure::clock::SystemClock;

/// Error returned when building or starting an engine fails.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The health endpoint could not bind
    #[error("failed to bind health endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

struct ExtraTarget {
    name: String,
    adapter: Adapter,
    timeout: Duration,
}

/// Builder for a [`CollectionEngine`] over the built-in adapters.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    sources: Vec<(Arc<dyn SampleSource>, Option<Duration>)>,
    session_source: Option<Arc<dyn SessionSource>>,
    extra_targets: Vec<ExtraTarget>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            sources: Vec::new(),
            session_source: None,
            extra_targets: Vec::new(),
        }
    }

    /// Set the clock used by circuit breakers.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Poll `source` every collection interval.
    pub fn with_source(mut self, source: Arc<dyn SampleSource>) -> Self {
        self.sources.push((source, None));
        self
    }

    /// Poll `source` on its own interval.
    pub fn with_source_interval(mut self, source: Arc<dyn SampleSource>, interval: Duration) -> Self {
        self.sources.push((source, Some(interval)));
        self
    }

    /// Enable Active Session History sampling from `source`.
    pub fn with_session_source(mut self, source: Arc<dyn SessionSource>) -> Self {
        self.session_source = Some(source);
        self
    }

    /// Add a target backed by an already constructed adapter. It uses the
    /// engine-wide breaker settings.
    pub fn with_target(mut self, name: impl Into<String>, adapter: Adapter, timeout: Duration) -> Self {
        self.extra_targets.push(ExtraTarget {
            name: name.into(),
            adapter,
            timeout,
        });
        self
    }

    /// Build the engine without starting any task.
    ///
    /// # Errors
    /// Returns [`BuildError::Config`] if the configuration is invalid or an
    /// adapter cannot be created.
    pub fn build(self) -> Result<CollectionEngine<Adapter>, BuildError> {
        let config = self.config;
        config.validate()?;

        let metrics = Metrics::new();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let resource = Arc::new(config.resource());
        let limiter = Arc::new(CardinalityLimiter::with_metrics(
            config.cardinality.clone(),
            metrics.clone(),
        ));
        let pipeline = CollectionPipeline::new(
            Arc::clone(&limiter),
            AdaptiveSampler::new(config.sampler.clone()),
            Arc::clone(&resource),
            metrics.clone(),
        );

        let breaker = |overrides: Option<&CircuitBreakerConfig>| {
            let settings = overrides.unwrap_or(&config.circuit_breaker).clone();
            CircuitBreaker::new(settings, Arc::clone(&clock))
        };

        let mut names = HashSet::new();
        let mut targets = Vec::new();
        for target in &config.export.targets {
            names.insert(target.name.clone());
            let adapter = Adapter::from_config(&target.name, &target.adapter)?;
            targets.push(ExportTarget::new(
                target.name.as_str(),
                adapter,
                breaker(target.circuit_breaker.as_ref()),
                target.timeout,
            ));
        }
        for extra in self.extra_targets {
            if !names.insert(extra.name.clone()) {
                return Err(ConfigError::DuplicateTarget(extra.name).into());
            }
            if extra.timeout.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    field: format!("export.targets.{}.timeout", extra.name),
                }
                .into());
            }
            targets.push(ExportTarget::new(extra.name, extra.adapter, breaker(None), extra.timeout));
        }
        if targets.is_empty() {
            tracing::warn!("no export targets configured, metrics will be discarded");
        }

        let shutdown = tokio_util::sync::CancellationToken::new();
        let exporter = ExportManager::new(
            targets,
            config.export.retry.clone(),
            shutdown.clone(),
            config.export.shutdown_grace,
            metrics.clone(),
        );

        let ash = self.session_source.map(|source| {
            let (writer, reader) = ring(config.ash.capacity);
            let sampler = AshSampler::new(
                source,
                writer,
                Arc::clone(&limiter),
                Arc::clone(&resource),
                metrics.clone(),
            );
            (sampler, reader)
        });

        let schedule = Schedule {
            collection_interval: config.collection.interval,
            export_interval: config.export.interval,
            maintenance_interval: config.maintenance.interval,
            maintenance_mode: config.maintenance.mode,
            ash_interval: config.ash.interval,
            queue_capacity: config.collection.queue_capacity,
            shutdown_grace: config.export.shutdown_grace,
        };

        let engine = CollectionEngine::new(pipeline, exporter, ash, schedule, shutdown, metrics);
        for (source, interval) in self.sources {
            match interval {
                Some(interval) => engine.add_source_with_interval(source, interval),
                None => engine.add_source(source),
            }
        }
        Ok(engine)
    }

    /// Build the engine, start its tasks and, if configured, serve the
    /// health endpoint.
    ///
    /// # Errors
    /// Returns [`BuildError`] if the configuration is invalid or the health
    /// endpoint cannot bind.
    pub async fn start(self) -> Result<CollectionEngine<Adapter>, BuildError> {
        let listen = self.config.health.listen_addr()?;
        let engine = self.build()?;

        #[cfg(feature = "health-server")]
        {
            if let Some(addr) = listen {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|source| BuildError::Bind { addr, source })?;
                let handle = crate::infrastructure::health_server::spawn(
                    listener,
                    engine.health_probe(),
                    engine.shutdown_token(),
                );
                engine.attach_task(handle);
            }
        }
        #[cfg(not(feature = "health-server"))]
        {
            if listen.is_some() {
                tracing::warn!("health.listen is set but the health-server feature is disabled");
            }
        }

        engine.start();
        Ok(engine)
    }
}

impl CollectionEngine<Adapter> {
    /// Shorthand for [`EngineBuilder::new`].
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }
}
