//! Export adapters.
//!
//! The set of adapters is closed: [`Adapter`] enumerates every backend the
//! engine can deliver to, and [`AdapterConfig`] is its configuration-side
//! mirror. Each variant implements the same
//! [`ExportAdapter`](crate::application::ports::ExportAdapter) contract.

pub mod json_lines;
pub mod otlp;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::ports::{ExportAdapter, ExportOutcome};
use crate::domain::metric::ExportBatch;
use crate::error::{ConfigError, ExportError};

pub use json_lines::JsonLinesAdapter;
pub use otlp::OtlpAdapter;

#[cfg(any(test, feature = "test-helpers"))]
use crate::infrastructure::mocks::MockAdapter;

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// One configured export destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique target name, used in logs, reports and health output
    pub name: String,
    /// Per-call timeout
    #[serde(default = "default_timeout", with = "crate::config::duration_serde")]
    pub timeout: Duration,
    #[serde(flatten)]
    pub adapter: AdapterConfig,
    /// Overrides the engine-wide breaker settings for this target
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, adapter: AdapterConfig) -> Self {
        Self {
            name: name.into(),
            timeout: default_timeout(),
            adapter,
            circuit_breaker: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// # Errors
    /// Returns [`ConfigError`] for an empty name, a zero timeout, invalid
    /// breaker overrides or an unusable endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidTarget {
                target: self.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: format!("export.targets.{}.timeout", self.name),
            });
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let AdapterConfig::Otlp { endpoint, .. } = &self.adapter {
            otlp::metrics_url(endpoint).map_err(|reason| ConfigError::InvalidTarget {
                target: self.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// Backend-specific settings, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// Newline-delimited JSON to stdout, or appended to `path`
    JsonLines {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// OTLP/HTTP protobuf
    Otlp {
        /// Collector base URL; `/v1/metrics` is appended unless present
        endpoint: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        compression: Compression,
    },
}

/// Request body compression for OTLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

/// Every supported export backend.
#[derive(Debug)]
pub enum Adapter {
    JsonLines(JsonLinesAdapter),
    Otlp(OtlpAdapter),
    /// Scripted adapter for tests
    #[cfg(any(test, feature = "test-helpers"))]
    Mock(MockAdapter),
}

impl Adapter {
    /// Create the adapter described by `config`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the sink cannot be opened or the endpoint
    /// is invalid.
    pub fn from_config(target: &str, config: &AdapterConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTarget {
            target: target.to_string(),
            reason,
        };
        match config {
            AdapterConfig::JsonLines { path: None } => Ok(Adapter::JsonLines(JsonLinesAdapter::stdout())),
            AdapterConfig::JsonLines { path: Some(path) } => JsonLinesAdapter::append_to(path)
                .map(Adapter::JsonLines)
                .map_err(|e| invalid(format!("cannot open {}: {e}", path.display()))),
            AdapterConfig::Otlp {
                endpoint,
                headers,
                compression,
            } => OtlpAdapter::new(endpoint, headers, *compression)
                .map(Adapter::Otlp)
                .map_err(invalid),
        }
    }
}

#[async_trait]
impl ExportAdapter for Adapter {
    fn kind(&self) -> &'static str {
        match self {
            Adapter::JsonLines(a) => a.kind(),
            Adapter::Otlp(a) => a.kind(),
            #[cfg(any(test, feature = "test-helpers"))]
            Adapter::Mock(a) => a.kind(),
        }
    }

    async fn export(&self, batch: &ExportBatch) -> Result<ExportOutcome, ExportError> {
        match self {
            Adapter::JsonLines(a) => a.export(batch).await,
            Adapter::Otlp(a) => a.export(batch).await,
            #[cfg(any(test, feature = "test-helpers"))]
            Adapter::Mock(a) => a.export(batch).await,
        }
    }
}
