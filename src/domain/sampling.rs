//! Sampling rules.
//!
//! A rule is a conjunction of attribute conditions plus an action. Rules are
//! evaluated in order by the adaptive sampler and the first match wins.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// One predicate over a sample attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<String>,
}

impl Condition {
    pub fn new(attribute: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value: Some(value.into()),
        }
    }

    /// Condition that holds when the attribute is present.
    pub fn exists(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            operator: Operator::Exists,
            value: None,
        }
    }

    /// Evaluate against the attribute's value, `None` if the sample does not
    /// carry it.
    ///
    /// Ordering operators compare numerically when both sides parse as
    /// numbers and lexically otherwise.
    pub fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return self.operator == Operator::Ne;
        };
        if self.operator == Operator::Exists {
            return true;
        }
        let Some(expected) = self.value.as_deref() else {
            return false;
        };

        match self.operator {
            Operator::Contains => actual.contains(expected),
            Operator::Eq => compare(actual, expected).is_eq(),
            Operator::Ne => compare(actual, expected).is_ne(),
            Operator::Gt => compare(actual, expected).is_gt(),
            Operator::Gte => compare(actual, expected).is_ge(),
            Operator::Lt => compare(actual, expected).is_lt(),
            Operator::Lte => compare(actual, expected).is_le(),
            Operator::Exists => true,
        }
    }
}

fn compare(actual: &str, expected: &str) -> std::cmp::Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.total_cmp(&b),
        _ => actual.cmp(expected),
    }
}

/// What to do with a sample that matches a rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Keep,
    Drop,
    /// Keep with the given probability in `[0, 1]`.
    Probability(f64),
}

/// A named, ordered sampling rule.
///
/// ```
/// use collection_engine::domain::sampling::{Condition, Operator, RuleAction, SamplingRule};
///
/// let rule = SamplingRule::new("drop-health-checks", RuleAction::Drop)
///     .with_condition(Condition::new("query.text", Operator::Contains, "pg_is_in_recovery"));
/// assert!(rule.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRule {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: RuleAction,
}

impl SamplingRule {
    /// A rule with no conditions; it matches every sample.
    pub fn new(name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            action,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether every condition holds. `lookup` resolves attribute names.
    pub fn matches<'a, F>(&self, mut lookup: F) -> bool
    where
        F: FnMut(&str) -> Option<Cow<'a, str>>,
    {
        self.conditions
            .iter()
            .all(|c| c.matches(lookup(&c.attribute).as_deref()))
    }

    /// Check the rule is well formed.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidRule`] for a probability outside `[0, 1]`
    /// or a comparison without a value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let RuleAction::Probability(p) = self.action {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidRule {
                    rule: self.name.clone(),
                    reason: format!("probability must be within [0.0, 1.0], got {p}"),
                });
            }
        }
        for condition in &self.conditions {
            if condition.attribute.is_empty() {
                return Err(ConfigError::InvalidRule {
                    rule: self.name.clone(),
                    reason: "condition attribute must not be empty".to_string(),
                });
            }
            if condition.operator != Operator::Exists && condition.value.is_none() {
                return Err(ConfigError::InvalidRule {
                    rule: self.name.clone(),
                    reason: format!("condition on `{}` requires a value", condition.attribute),
                });
            }
        }
        Ok(())
    }
}
