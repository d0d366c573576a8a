//! Sample to metric conversion.
//!
//! Every sample is fingerprinted, has each of its dimensions resolved through
//! the cardinality limiter, and is then offered to the adaptive sampler.
//! Kept samples become unified metrics. Raw statement text never reaches a
//! metric; only the fingerprint id and the normalized text do.

use std::sync::Arc;

use crate::application::cardinality::{Admission, CardinalityLimiter};
use crate::application::metrics::Metrics;
use crate::application::sampler::AdaptiveSampler;
use crate::domain::dimension::{DimensionClass, OTHER};
use crate::domain::fingerprint::Fingerprint;
use crate::domain::metric::{names, Attributes, MetricKind, Resource, UnifiedMetric};
use crate::domain::sample::{RawSample, SampleKind};

/// Attribute carrying the normalized statement text.
pub const NORMALIZED_TEXT_KEY: &str = "db.query.text";
/// Attribute carrying the sample kind.
pub const SAMPLE_KIND_KEY: &str = "sample.kind";

/// Converts raw samples into bounded-cardinality metrics.
#[derive(Debug)]
pub struct CollectionPipeline {
    limiter: Arc<CardinalityLimiter>,
    sampler: AdaptiveSampler,
    resource: Arc<Resource>,
    metrics: Metrics,
}

impl CollectionPipeline {
    pub fn new(
        limiter: Arc<CardinalityLimiter>,
        sampler: AdaptiveSampler,
        resource: Arc<Resource>,
        metrics: Metrics,
    ) -> Self {
        Self {
            limiter,
            sampler,
            resource,
            metrics,
        }
    }

    /// Process one sample. Returns no metrics if the sample was dropped.
    pub fn process(&self, sample: &RawSample) -> Vec<UnifiedMetric> {
        self.metrics.record_sample_received();

        let fingerprint = sample.query_text().map(Fingerprint::of);
        // Weight in whole milliseconds; every sample counts at least once.
        let weight = (sample.duration_ms().round() as u64).max(1);
        let attributes = self.resolve_attributes(sample, fingerprint.as_ref(), weight);

        if !self.sampler.decide(sample, fingerprint.as_ref()).keep {
            self.metrics.record_sample_dropped();
            return Vec::new();
        }
        self.metrics.record_sample_kept();

        let duration_name = match sample.kind() {
            SampleKind::SlowQuery => names::QUERY_DURATION,
            SampleKind::BlockingSession => names::BLOCKING_DURATION,
            SampleKind::SessionSnapshot => names::SESSION_DURATION,
        };

        let mut metrics = Vec::with_capacity(1 + sample.measurements().len());
        metrics.push(UnifiedMetric {
            name: duration_name.to_string(),
            kind: MetricKind::Gauge,
            unit: "ms".to_string(),
            value: sample.duration_ms(),
            attributes: attributes.clone(),
            timestamp: sample.timestamp(),
            resource: Arc::clone(&self.resource),
        });
        for (name, value) in sample.measurements() {
            metrics.push(UnifiedMetric {
                name: measurement_name(name),
                kind: MetricKind::Gauge,
                unit: "1".to_string(),
                value: *value,
                attributes: attributes.clone(),
                timestamp: sample.timestamp(),
                resource: Arc::clone(&self.resource),
            });
        }
        metrics
    }

    /// Process a set of samples, concatenating the kept metrics.
    pub fn process_all<'a, I>(&self, samples: I) -> Vec<UnifiedMetric>
    where
        I: IntoIterator<Item = &'a RawSample>,
    {
        samples
            .into_iter()
            .flat_map(|sample| self.process(sample))
            .collect()
    }

    fn resolve_attributes(
        &self,
        sample: &RawSample,
        fingerprint: Option<&Fingerprint>,
        weight: u64,
    ) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(SAMPLE_KIND_KEY.to_string(), sample.kind().as_str().into());

        if let Some(fp) = fingerprint {
            let class = DimensionClass::QueryFingerprint;
            let hex = fp.hex();
            match self.limiter.admit(&class, &hex, weight) {
                Admission::Overflow => {
                    attributes.insert(class.attribute_key().to_string(), OTHER.into());
                }
                Admission::Tracked | Admission::Allowlisted => {
                    attributes.insert(NORMALIZED_TEXT_KEY.to_string(), fp.normalized().into());
                    attributes.insert(class.attribute_key().to_string(), hex.into());
                }
            }
        }

        let database = self
            .limiter
            .resolve(&DimensionClass::Database, sample.database(), weight);
        attributes.insert(
            DimensionClass::Database.attribute_key().to_string(),
            database.into(),
        );

        let statement_type = sample
            .dimension(&DimensionClass::StatementType)
            .or_else(|| fingerprint.map(Fingerprint::statement_type));
        if let Some(statement_type) = statement_type {
            let class = DimensionClass::StatementType;
            let resolved = self.limiter.resolve(&class, statement_type, weight);
            attributes.insert(class.attribute_key().to_string(), resolved.into());
        }

        for key in sample.dimensions() {
            match key.class {
                DimensionClass::Database | DimensionClass::StatementType => continue,
                DimensionClass::QueryFingerprint if fingerprint.is_some() => continue,
                _ => {}
            }
            let resolved = self.limiter.resolve(&key.class, &key.value, weight);
            attributes.insert(key.attribute_key().to_string(), resolved.into());
        }

        attributes
    }

    pub fn limiter(&self) -> &CardinalityLimiter {
        &self.limiter
    }

    pub(crate) fn shared_limiter(&self) -> Arc<CardinalityLimiter> {
        Arc::clone(&self.limiter)
    }
}

fn measurement_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("db.query.{name}")
    }
}
