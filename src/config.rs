//! Engine configuration.
//!
//! The configuration is a plain serde structure, usually read from TOML.
//! Durations use humantime notation (`"30s"`, `"5m"`, `"250ms"`).
//! [`EngineConfig::validate`] must pass before the engine starts; an
//! invalid configuration is fatal.
//!
//! ```
//! use collection_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     [sampler]
//!     hard_threshold = "2s"
//!     default_rate = 0.25
//!     seed = 7
//!
//!     [cardinality.default]
//!     max_tracked = 500
//!
//!     [cardinality.classes.query_fingerprint]
//!     max_tracked = 200
//!
//!     [[export.targets]]
//!     name = "local"
//!     kind = "json_lines"
//! "#).unwrap();
//!
//! assert_eq!(config.sampler.default_rate, 0.25);
//! assert_eq!(config.export.targets.len(), 1);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::ash::AshConfig;
use crate::application::cardinality::{CardinalityConfig, MaintenanceMode};
use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::export::RetryPolicy;
use crate::application::sampler::SamplerConfig;
use crate::domain::metric::Resource;
use crate::error::ConfigError;
use crate::infrastructure::adapters::TargetConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub cardinality: CardinalityConfig,
    pub maintenance: MaintenanceConfig,
    pub sampler: SamplerConfig,
    /// Breaker settings for targets without their own
    pub circuit_breaker: CircuitBreakerConfig,
    pub collection: CollectionConfig,
    pub export: ExportConfig,
    pub ash: AshConfig,
    pub health: HealthConfig,
    /// Extra resource attributes, merged over the defaults
    pub resource: BTreeMap<String, String>,
}

/// Periodic tracker maintenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    pub mode: MaintenanceMode,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            mode: MaintenanceMode::Reset,
        }
    }
}

/// Sample producer scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Interval for sources registered without their own
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Maximum metrics buffered between export cycles
    pub queue_capacity: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            queue_capacity: 10_000,
        }
    }
}

/// Export scheduling and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    pub retry: RetryPolicy,
    /// How long in-flight exports may run after shutdown is requested
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
    pub targets: Vec<TargetConfig>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(5),
            targets: Vec::new(),
        }
    }
}

/// Health endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Address for the HTTP health endpoint; disabled when unset
    pub listen: Option<String>,
}

impl HealthConfig {
    /// Parsed listen address.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidAddress`] if the address does not parse.
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.listen
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))
            })
            .transpose()
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed documents and any
    /// validation error.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound and threshold.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cardinality.validate()?;
        self.sampler.validate()?;
        self.circuit_breaker.validate()?;
        self.export.retry.validate()?;
        self.ash.validate()?;

        if self.maintenance.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "maintenance.interval".to_string(),
            });
        }
        if let MaintenanceMode::Decay(factor) = self.maintenance.mode {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(ConfigError::OutOfRange {
                    field: "maintenance.mode.decay".to_string(),
                    reason: format!("factor must be within (0.0, 1.0), got {factor}"),
                });
            }
        }
        if self.collection.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "collection.interval".to_string(),
            });
        }
        if self.collection.queue_capacity == 0 {
            return Err(ConfigError::ZeroCount {
                field: "collection.queue_capacity".to_string(),
            });
        }
        if self.export.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "export.interval".to_string(),
            });
        }

        let mut names = HashSet::new();
        for target in &self.export.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }
            target.validate()?;
        }

        self.health.listen_addr()?;
        Ok(())
    }

    /// Resource attributes shared by every exported metric.
    pub fn resource(&self) -> Resource {
        let mut attributes: BTreeMap<String, String> = BTreeMap::from([
            ("service.name".to_string(), "collection-engine".to_string()),
            ("service.version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("db.system".to_string(), "postgresql".to_string()),
        ]);
        attributes.extend(self.resource.clone());
        Resource::new(attributes)
    }
}

/// Serde adapter for humantime durations.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
