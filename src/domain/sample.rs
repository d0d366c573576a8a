//! Raw samples handed to the engine by producers.
//!
//! A [`RawSample`] is immutable once built. Its statement text is untrusted
//! and never leaves the engine; only the fingerprint derived from it does.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::domain::dimension::{DimensionClass, DimensionKey};
use crate::error::SampleError;

/// Producer category of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleKind {
    /// A statement that exceeded the slow-query threshold
    SlowQuery,
    /// A session blocked on another session's lock
    BlockingSession,
    /// A point-in-time view of one session
    SessionSnapshot,
}

impl SampleKind {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::SlowQuery => "slow_query",
            SampleKind::BlockingSession => "blocking_session",
            SampleKind::SessionSnapshot => "session_snapshot",
        }
    }
}

/// A single raw observation from a producer.
///
/// ```
/// use collection_engine::domain::sample::{RawSample, SampleKind};
/// use collection_engine::domain::dimension::DimensionClass;
///
/// let sample = RawSample::builder(SampleKind::SlowQuery, "orders")
///     .query_text("SELECT * FROM items WHERE id = 1")
///     .duration_ms(1250.0)
///     .dimension(DimensionClass::Table, "items")
///     .measurement("rows", 1.0)
///     .build()
///     .unwrap();
///
/// assert_eq!(sample.duration_ms(), 1250.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    kind: SampleKind,
    query_text: Option<String>,
    duration: Duration,
    /// Sorted by class, at most one key per class
    dimensions: Vec<DimensionKey>,
    database: String,
    timestamp: SystemTime,
    measurements: BTreeMap<String, f64>,
}

impl RawSample {
    /// Start building a sample of `kind` observed on `database`.
    pub fn builder(kind: SampleKind, database: impl Into<String>) -> RawSampleBuilder {
        RawSampleBuilder {
            kind,
            query_text: None,
            duration_ms: 0.0,
            dimensions: BTreeMap::new(),
            database: database.into(),
            timestamp: None,
            measurements: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    /// Untrusted statement text, if the producer captured one.
    pub fn query_text(&self) -> Option<&str> {
        self.query_text.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Duration in fractional milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_nanos() as f64 / 1_000_000.0
    }

    pub fn dimensions(&self) -> &[DimensionKey] {
        &self.dimensions
    }

    pub fn dimension(&self, class: &DimensionClass) -> Option<&str> {
        self.dimensions
            .binary_search_by(|key| key.class.cmp(class))
            .ok()
            .map(|i| self.dimensions[i].value.as_str())
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn measurements(&self) -> &BTreeMap<String, f64> {
        &self.measurements
    }
}

/// Builder for [`RawSample`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RawSampleBuilder {
    kind: SampleKind,
    query_text: Option<String>,
    duration_ms: f64,
    dimensions: BTreeMap<DimensionClass, String>,
    database: String,
    timestamp: Option<SystemTime>,
    measurements: BTreeMap<String, f64>,
}

impl RawSampleBuilder {
    pub fn query_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn duration_ms(mut self, ms: f64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_nanos() as f64 / 1_000_000.0;
        self
    }

    pub fn dimension(mut self, class: DimensionClass, value: impl Into<String>) -> Self {
        self.dimensions.insert(class, value.into());
        self
    }

    pub fn measurement(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(name.into(), value);
        self
    }

    /// Observation time. Defaults to now.
    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validate and build the sample.
    ///
    /// # Errors
    /// Returns [`SampleError`] if the duration or any measurement is negative
    /// or not finite, or if a custom dimension reuses an engine attribute.
    pub fn build(self) -> Result<RawSample, SampleError> {
        if let Some(class) = self.dimensions.keys().find(|class| class.is_reserved()) {
            return Err(SampleError::ReservedDimension(class.to_string()));
        }
        if !self.duration_ms.is_finite() || self.duration_ms < 0.0 {
            return Err(SampleError::InvalidDuration(self.duration_ms));
        }
        let nanos = (self.duration_ms * 1_000_000.0).round();
        if nanos >= u64::MAX as f64 {
            return Err(SampleError::InvalidDuration(self.duration_ms));
        }
        let duration = Duration::from_nanos(nanos as u64);
        if let Some((name, value)) = self
            .measurements
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(SampleError::InvalidMeasurement {
                name: name.clone(),
                value: *value,
            });
        }

        Ok(RawSample {
            kind: self.kind,
            query_text: self.query_text,
            duration,
            dimensions: self
                .dimensions
                .into_iter()
                .map(|(class, value)| DimensionKey::new(class, value))
                .collect(),
            database: self.database,
            timestamp: self.timestamp.unwrap_or_else(SystemTime::now),
            measurements: self.measurements,
        })
    }
}

/// One row of a session activity view, as seen by the ASH sampler.
///
/// Sessions are aggregated, never exported one by one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActiveSession {
    pub database: String,
    pub user: String,
    /// Session state such as `active` or `idle in transaction`
    pub state: String,
    pub wait_event_type: Option<String>,
    pub wait_event: Option<String>,
    pub backend_type: String,
    /// Untrusted statement text; it is fingerprinted before aggregation
    pub query_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_duration_rejected() {
        let err = RawSample::builder(SampleKind::SlowQuery, "db")
            .duration_ms(-1.0)
            .build()
            .unwrap_err();
        assert_eq!(err, SampleError::InvalidDuration(-1.0));
    }

    #[test]
    fn test_non_finite_measurement_rejected() {
        let err = RawSample::builder(SampleKind::SlowQuery, "db")
            .measurement("rows", f64::NAN)
            .build()
            .unwrap_err();
        assert!(matches!(err, SampleError::InvalidMeasurement { ref name, .. } if name == "rows"));
    }

    #[test]
    fn test_builder_defaults() {
        let sample = RawSample::builder(SampleKind::BlockingSession, "db")
            .build()
            .unwrap();
        assert_eq!(sample.duration(), Duration::ZERO);
        assert!(sample.query_text().is_none());
        assert!(sample.measurements().is_empty());
        assert_eq!(sample.kind().as_str(), "blocking_session");
    }

    #[test]
    fn test_dimensions_sorted_and_last_write_wins() {
        let sample = RawSample::builder(SampleKind::SlowQuery, "db")
            .dimension(DimensionClass::User, "first")
            .dimension(DimensionClass::Table, "items")
            .dimension(DimensionClass::User, "app")
            .build()
            .unwrap();
        let classes: Vec<_> = sample.dimensions().iter().map(|k| k.class.clone()).collect();
        assert_eq!(classes, vec![DimensionClass::Table, DimensionClass::User]);
        assert_eq!(sample.dimension(&DimensionClass::User), Some("app"));
        assert_eq!(sample.dimension(&DimensionClass::Database), None);
    }

    #[test]
    fn test_reserved_custom_dimension_rejected() {
        let err = RawSample::builder(SampleKind::SlowQuery, "db")
            .dimension(DimensionClass::Custom("db.query.text".to_string()), "select 'secret'")
            .build()
            .unwrap_err();
        assert_eq!(err, SampleError::ReservedDimension("db.query.text".to_string()));
    }
}
