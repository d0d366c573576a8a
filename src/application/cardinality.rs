//! Per-class cardinality limiting.
//!
//! Each dimension class is bounded by a Space-Saving tracker of `max_tracked`
//! entries. Values that cannot be tracked are folded into the synthetic
//! [`OTHER`] value so the number of distinct values exported per class never
//! exceeds `max_tracked` plus the class allowlist plus one.
//!
//! Weight is conserved exactly: for every class, the weight attributed to
//! tracked values (`count - error`) plus the weight of `other` equals the
//! total admitted weight since the last reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::application::metrics::Metrics;
use crate::domain::dimension::{DimensionClass, OTHER};
use crate::error::ConfigError;

/// Bound and allowlist for one dimension class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimits {
    /// Maximum number of distinct non-allowlisted values tracked
    pub max_tracked: usize,
    /// Values that are always passed through and never evicted
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl ClassLimits {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            max_tracked,
            allowlist: Vec::new(),
        }
    }

    pub fn with_allowlist<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist.extend(values.into_iter().map(Into::into));
        self
    }
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Periodic maintenance applied to every tracker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceMode {
    /// Drop all non-allowlisted counts.
    #[default]
    Reset,
    /// Multiply every count by the factor, dropping entries that reach zero.
    Decay(f64),
}

/// Limits for every dimension class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CardinalityConfig {
    /// Limits for classes without an explicit entry
    #[serde(default)]
    pub default: ClassLimits,
    /// Per-class overrides
    #[serde(default)]
    pub classes: BTreeMap<DimensionClass, ClassLimits>,
}

impl CardinalityConfig {
    pub fn with_class(mut self, class: DimensionClass, limits: ClassLimits) -> Self {
        self.classes.insert(class, limits);
        self
    }

    /// Limits that apply to `class`.
    pub fn limits_for(&self, class: &DimensionClass) -> &ClassLimits {
        self.classes.get(class).unwrap_or(&self.default)
    }

    /// # Errors
    /// Returns [`ConfigError::ZeroMaxTracked`] if any class allows no values,
    /// or [`ConfigError::ReservedDimension`] if a custom class reuses an
    /// engine attribute name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default.max_tracked == 0 {
            return Err(ConfigError::ZeroMaxTracked {
                class: "default".to_string(),
            });
        }
        for (class, limits) in &self.classes {
            if class.is_reserved() {
                return Err(ConfigError::ReservedDimension(class.to_string()));
            }
            if limits.max_tracked == 0 {
                return Err(ConfigError::ZeroMaxTracked {
                    class: class.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// How a value was resolved by [`CardinalityLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The value is allowlisted and passed through untracked.
    Allowlisted,
    /// The value is (now) tracked.
    Tracked,
    /// The value did not fit and was folded into `other`.
    Overflow,
}

impl Admission {
    /// The value to attach to the metric.
    pub fn resolve<'a>(&self, value: &'a str) -> &'a str {
        match self {
            Admission::Overflow => OTHER,
            Admission::Allowlisted | Admission::Tracked => value,
        }
    }
}

/// A tracked value and its Space-Saving counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedValue {
    pub value: String,
    /// Upper bound on the value's weight
    pub count: u64,
    /// Maximum over-count carried from an evicted entry
    pub error: u64,
}

/// Point-in-time view of one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassSnapshot {
    pub class: DimensionClass,
    pub tracked: usize,
    pub max_tracked: usize,
    pub allowlisted: usize,
    pub other_weight: u64,
    pub admitted_weight: u64,
    pub overflows: u64,
    pub evictions: u64,
    /// Tracked values, heaviest first
    pub top: Vec<TrackedValue>,
}

impl ClassSnapshot {
    /// Weight attributed to tracked values, `sum(count - error)`.
    pub fn attributed_weight(&self) -> u64 {
        self.top.iter().map(|t| t.count - t.error).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    error: u64,
    seq: u64,
}

/// Space-Saving top-K tracker for one class.
#[derive(Debug)]
pub(crate) struct SpaceSavingTracker {
    max_tracked: usize,
    allowlist: AHashSet<String>,
    entries: AHashMap<String, Entry>,
    allowlisted: AHashMap<String, u64>,
    other: u64,
    admitted: u64,
    overflows: u64,
    evictions: u64,
    next_seq: u64,
}

impl SpaceSavingTracker {
    pub(crate) fn new(limits: &ClassLimits) -> Self {
        Self {
            max_tracked: limits.max_tracked,
            allowlist: limits.allowlist.iter().cloned().collect(),
            entries: AHashMap::with_capacity(limits.max_tracked),
            allowlisted: AHashMap::new(),
            other: 0,
            admitted: 0,
            overflows: 0,
            evictions: 0,
            next_seq: 0,
        }
    }

    pub(crate) fn admit(&mut self, value: &str, weight: u64) -> Admission {
        if self.allowlist.contains(value) {
            *self.allowlisted.entry(value.to_string()).or_insert(0) += weight;
            return Admission::Allowlisted;
        }

        self.admitted += weight;

        if let Some(entry) = self.entries.get_mut(value) {
            entry.count += weight;
            return Admission::Tracked;
        }

        if self.entries.len() < self.max_tracked {
            self.insert(value, weight, 0);
            return Admission::Tracked;
        }

        let Some((victim, min)) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.count, e.seq))
            .map(|(k, e)| (k.clone(), *e))
        else {
            self.other += weight;
            self.overflows += 1;
            return Admission::Overflow;
        };

        if weight > min.count {
            self.entries.remove(&victim);
            self.other += min.count - min.error;
            self.evictions += 1;
            self.insert(value, min.count + weight, min.count);
            Admission::Tracked
        } else {
            self.other += weight;
            self.overflows += 1;
            Admission::Overflow
        }
    }

    fn insert(&mut self, value: &str, count: u64, error: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(value.to_string(), Entry { count, error, seq });
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.other = 0;
        self.admitted = 0;
    }

    pub(crate) fn decay(&mut self, factor: f64) {
        let scale = |v: u64| (v as f64 * factor).floor() as u64;
        self.entries.retain(|_, e| {
            e.count = scale(e.count);
            e.error = scale(e.error).min(e.count);
            e.count > 0
        });
        self.other = scale(self.other);
        self.admitted = self.other + self.entries.values().map(|e| e.count - e.error).sum::<u64>();
    }

    pub(crate) fn snapshot(&self, class: &DimensionClass) -> ClassSnapshot {
        let mut top: Vec<TrackedValue> = self
            .entries
            .iter()
            .map(|(value, e)| TrackedValue {
                value: value.clone(),
                count: e.count,
                error: e.error,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));

        ClassSnapshot {
            class: class.clone(),
            tracked: self.entries.len(),
            max_tracked: self.max_tracked,
            allowlisted: self.allowlisted.len(),
            other_weight: self.other,
            admitted_weight: self.admitted,
            overflows: self.overflows,
            evictions: self.evictions,
            top,
        }
    }
}

/// Bounds the number of distinct values per dimension class.
///
/// Classes are independent: each has its own lock, so concurrent producers
/// admitting values for different classes never contend.
///
/// ```
/// use collection_engine::application::cardinality::{CardinalityConfig, CardinalityLimiter, ClassLimits};
/// use collection_engine::domain::dimension::DimensionClass;
///
/// let config = CardinalityConfig::default()
///     .with_class(DimensionClass::Table, ClassLimits::new(2));
/// let limiter = CardinalityLimiter::new(config);
///
/// assert_eq!(limiter.resolve(&DimensionClass::Table, "a", 5), "a");
/// assert_eq!(limiter.resolve(&DimensionClass::Table, "b", 5), "b");
/// assert_eq!(limiter.resolve(&DimensionClass::Table, "c", 1), "other");
/// ```
#[derive(Debug)]
pub struct CardinalityLimiter {
    config: CardinalityConfig,
    trackers: DashMap<DimensionClass, Arc<Mutex<SpaceSavingTracker>>>,
    metrics: Metrics,
}

impl CardinalityLimiter {
    pub fn new(config: CardinalityConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    /// Create a limiter that records overflows on shared metrics.
    pub fn with_metrics(config: CardinalityConfig, metrics: Metrics) -> Self {
        Self {
            config,
            trackers: DashMap::new(),
            metrics,
        }
    }

    fn tracker(&self, class: &DimensionClass) -> Arc<Mutex<SpaceSavingTracker>> {
        if let Some(tracker) = self.trackers.get(class) {
            return Arc::clone(tracker.value());
        }
        let limits = self.config.limits_for(class);
        Arc::clone(
            self.trackers
                .entry(class.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SpaceSavingTracker::new(limits))))
                .value(),
        )
    }

    /// Count `weight` against `value` in `class`.
    pub fn admit(&self, class: &DimensionClass, value: &str, weight: u64) -> Admission {
        let admission = self.tracker(class).lock().admit(value, weight);
        if admission == Admission::Overflow {
            self.metrics.record_cardinality_overflow();
            tracing::trace!(class = %class, "dimension value folded into other");
        }
        admission
    }

    /// Count `weight` against `value` and return the value to export.
    pub fn resolve<'a>(&self, class: &DimensionClass, value: &'a str, weight: u64) -> &'a str {
        self.admit(class, value, weight).resolve(value)
    }

    /// Drop all non-allowlisted counts in every class.
    pub fn reset(&self) {
        for tracker in self.trackers.iter() {
            tracker.value().lock().reset();
        }
    }

    /// Scale every count by `factor`, which must be within `(0, 1)`.
    pub fn decay(&self, factor: f64) {
        for tracker in self.trackers.iter() {
            tracker.value().lock().decay(factor);
        }
    }

    /// Apply one round of periodic maintenance.
    pub fn maintain(&self, mode: MaintenanceMode) {
        match mode {
            MaintenanceMode::Reset => self.reset(),
            MaintenanceMode::Decay(factor) => self.decay(factor),
        }
    }

    /// Snapshot one class, `None` if nothing was admitted for it yet.
    pub fn class_snapshot(&self, class: &DimensionClass) -> Option<ClassSnapshot> {
        let tracker = self.trackers.get(class).map(|t| Arc::clone(t.value()))?;
        let snapshot = tracker.lock().snapshot(class);
        Some(snapshot)
    }

    /// Snapshot every class seen so far, ordered by class.
    pub fn snapshot(&self) -> Vec<ClassSnapshot> {
        let trackers: Vec<_> = self
            .trackers
            .iter()
            .map(|t| (t.key().clone(), Arc::clone(t.value())))
            .collect();
        let mut snapshots: Vec<ClassSnapshot> = trackers
            .into_iter()
            .map(|(class, tracker)| tracker.lock().snapshot(&class))
            .collect();
        snapshots.sort_by(|a, b| a.class.cmp(&b.class));
        snapshots
    }

    pub fn config(&self) -> &CardinalityConfig {
        &self.config
    }
}
