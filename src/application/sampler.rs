//! Adaptive sampling.
//!
//! Decides per sample whether to keep it:
//! 1. Samples slower than the hard threshold are always kept.
//! 2. Otherwise the first rule whose conditions all hold decides.
//! 3. Otherwise the default rate applies.
//!
//! With a seed configured, probabilistic decisions are reproducible: the
//! random draw is seeded from the seed combined with the sample's identity,
//! so the same input always gets the same decision regardless of call order.

use std::borrow::Cow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::{Duration, UNIX_EPOCH};

use ahash::RandomState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::dimension::DimensionClass;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::sample::RawSample;
use crate::domain::sampling::{RuleAction, SamplingRule};
use crate::error::ConfigError;

/// Configuration for the adaptive sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Samples slower than this are always kept
    #[serde(with = "crate::config::duration_serde")]
    pub hard_threshold: Duration,
    /// Ordered rules; the first match decides
    #[serde(default)]
    pub rules: Vec<SamplingRule>,
    /// Keep probability when no rule matches
    pub default_rate: f64,
    /// Seed for reproducible decisions
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            hard_threshold: Duration::from_secs(5),
            rules: Vec::new(),
            default_rate: 1.0,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn with_rule(mut self, rule: SamplingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// # Errors
    /// Returns [`ConfigError`] for a default rate outside `[0, 1]` or an
    /// invalid rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.default_rate) {
            return Err(ConfigError::InvalidRate {
                field: "sampler.default_rate".to_string(),
                value: self.default_rate,
            });
        }
        self.rules.iter().try_for_each(SamplingRule::validate)
    }
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Duration exceeded the hard threshold
    HardThreshold,
    /// The rule at this index matched
    Rule(usize),
    /// No rule matched
    DefaultRate,
}

/// Outcome of [`AdaptiveSampler::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingDecision {
    pub keep: bool,
    pub reason: DecisionReason,
}

/// Stateless adaptive sampler.
#[derive(Debug, Clone)]
pub struct AdaptiveSampler {
    config: SamplerConfig,
    hasher: RandomState,
}

impl AdaptiveSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let seed = config.seed.unwrap_or_default();
        Self {
            hasher: RandomState::with_seeds(seed, !seed, seed.rotate_left(32), 0x5eed),
            config,
        }
    }

    /// Decide whether to keep `sample`.
    pub fn decide(&self, sample: &RawSample, fingerprint: Option<&Fingerprint>) -> SamplingDecision {
        if sample.duration() > self.config.hard_threshold {
            return SamplingDecision {
                keep: true,
                reason: DecisionReason::HardThreshold,
            };
        }

        let lookup = |attr: &str| attribute(sample, fingerprint, attr);
        let (action, reason) = self
            .config
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(lookup))
            .map(|(i, rule)| (rule.action, DecisionReason::Rule(i)))
            .unwrap_or((
                RuleAction::Probability(self.config.default_rate),
                DecisionReason::DefaultRate,
            ));

        let keep = match action {
            RuleAction::Keep => true,
            RuleAction::Drop => false,
            RuleAction::Probability(p) => self.draw(sample, fingerprint, p),
        };

        if !keep {
            tracing::trace!(
                database = sample.database(),
                kind = sample.kind().as_str(),
                ?reason,
                "sample dropped"
            );
        }
        SamplingDecision { keep, reason }
    }

    fn draw(&self, sample: &RawSample, fingerprint: Option<&Fingerprint>, p: f64) -> bool {
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        match self.config.seed {
            Some(_) => {
                let mut h = self.hasher.build_hasher();
                fingerprint.map(Fingerprint::id).hash(&mut h);
                sample
                    .timestamp()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .hash(&mut h);
                sample.database().hash(&mut h);
                sample.kind().hash(&mut h);
                StdRng::seed_from_u64(h.finish()).random_bool(p)
            }
            None => rand::rng().random_bool(p),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

/// Resolve a rule attribute against a sample. `query.text` exposes only the
/// normalized statement.
fn attribute<'a>(
    sample: &'a RawSample,
    fingerprint: Option<&'a Fingerprint>,
    attr: &str,
) -> Option<Cow<'a, str>> {
    match attr {
        "kind" => Some(Cow::Borrowed(sample.kind().as_str())),
        "database" => Some(Cow::Borrowed(sample.database())),
        "duration_ms" => Some(Cow::Owned(sample.duration_ms().to_string())),
        "query.fingerprint" => fingerprint.map(|fp| Cow::Owned(fp.hex())),
        "query.text" => fingerprint.map(|fp| Cow::Borrowed(fp.normalized())),
        _ => {
            if let Some(value) = sample.measurements().get(attr) {
                return Some(Cow::Owned(value.to_string()));
            }
            let class = DimensionClass::from(attr.to_string());
            match sample.dimension(&class) {
                Some(value) => Some(Cow::Borrowed(value)),
                None if class == DimensionClass::StatementType => {
                    fingerprint.map(|fp| Cow::Borrowed(fp.statement_type()))
                }
                None => None,
            }
        }
    }
}
