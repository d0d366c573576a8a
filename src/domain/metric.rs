//! The canonical metric model handed to export adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Metric names emitted by the engine.
pub mod names {
    pub const QUERY_DURATION: &str = "db.query.duration";
    pub const BLOCKING_DURATION: &str = "db.locks.blocking.duration";
    pub const SESSION_DURATION: &str = "db.session.duration";
    pub const ASH_ACTIVE_SESSIONS: &str = "db.ash.active_sessions";
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

/// Sorted attribute set.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Shape of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Attributes describing the entity that produced the metrics.
///
/// Shared by every metric of a batch; protocol adapters write it once per
/// batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Resource {
    attributes: Attributes,
}

impl Resource {
    /// Create a resource from attribute pairs.
    pub fn new<I, K, V>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        Self {
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// One dimensional data point in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedMetric {
    pub name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub value: f64,
    pub attributes: Attributes,
    #[serde(skip)]
    pub timestamp: SystemTime,
    #[serde(skip)]
    pub resource: Arc<Resource>,
}

impl UnifiedMetric {
    /// Create a gauge with no attributes.
    pub fn gauge(
        name: impl Into<String>,
        unit: impl Into<String>,
        value: f64,
        timestamp: SystemTime,
        resource: Arc<Resource>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            unit: unit.into(),
            value,
            attributes: Attributes::new(),
            timestamp,
            resource,
        }
    }

    /// Create a counter with no attributes.
    pub fn counter(
        name: impl Into<String>,
        unit: impl Into<String>,
        value: f64,
        timestamp: SystemTime,
        resource: Arc<Resource>,
    ) -> Self {
        Self {
            kind: MetricKind::Counter,
            ..Self::gauge(name, unit, value, timestamp, resource)
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Timestamp as nanoseconds since the Unix epoch.
    pub fn timestamp_unix_nanos(&self) -> u64 {
        unix_nanos(self.timestamp)
    }
}

pub(crate) fn unix_nanos(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// An immutable set of metrics produced by one collection cycle.
///
/// Cloning is cheap; every adapter receives the same shared slice.
#[derive(Debug, Clone)]
pub struct ExportBatch {
    cycle: u64,
    created_at: SystemTime,
    metrics: Arc<[UnifiedMetric]>,
}

impl ExportBatch {
    pub fn new(cycle: u64, metrics: Vec<UnifiedMetric>) -> Self {
        Self {
            cycle,
            created_at: SystemTime::now(),
            metrics: metrics.into(),
        }
    }

    /// Monotonic cycle number.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn metrics(&self) -> &[UnifiedMetric] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
