//! Dimension classes and keys.
//!
//! A dimension is a categorical attribute attached to a metric. Each class is
//! bounded independently by the cardinality limiter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value substituted for any dimension value that did not fit in its class's
/// tracked set.
pub const OTHER: &str = "other";

/// Attribute keys written by the engine itself. Custom classes may not use
/// them.
pub const RESERVED_ATTRIBUTE_KEYS: &[&str] = &[
    "db.query.text",
    "sample.kind",
    "query.fingerprint",
    "db.sql.table",
    "db.user",
    "db.operation",
    "db.name",
    "db.wait_event",
    "db.wait_event_type",
    "db.session.state",
    "db.backend_type",
];

/// A category of dimension values with its own cardinality bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DimensionClass {
    /// Query fingerprint id
    QueryFingerprint,
    /// Relation name
    Table,
    /// Database role
    User,
    /// Leading statement verb
    StatementType,
    /// Database name
    Database,
    /// Wait event name
    WaitEvent,
    /// Server process type, such as `client backend` or `autovacuum worker`
    BackendType,
    /// Any producer-defined dimension
    Custom(String),
}

impl DimensionClass {
    /// Configuration name of the class.
    pub fn as_str(&self) -> &str {
        match self {
            DimensionClass::QueryFingerprint => "query_fingerprint",
            DimensionClass::Table => "table",
            DimensionClass::User => "user",
            DimensionClass::StatementType => "statement_type",
            DimensionClass::Database => "database",
            DimensionClass::WaitEvent => "wait_event",
            DimensionClass::BackendType => "backend_type",
            DimensionClass::Custom(name) => name,
        }
    }

    /// Attribute key used on exported metrics.
    pub fn attribute_key(&self) -> &str {
        match self {
            DimensionClass::QueryFingerprint => "query.fingerprint",
            DimensionClass::Table => "db.sql.table",
            DimensionClass::User => "db.user",
            DimensionClass::StatementType => "db.operation",
            DimensionClass::Database => "db.name",
            DimensionClass::WaitEvent => "db.wait_event",
            DimensionClass::BackendType => "db.backend_type",
            DimensionClass::Custom(name) => name,
        }
    }

    /// Whether this is a custom class whose attribute key collides with one
    /// the engine writes.
    pub fn is_reserved(&self) -> bool {
        matches!(self, DimensionClass::Custom(name) if RESERVED_ATTRIBUTE_KEYS.contains(&name.as_str()))
    }
}

impl fmt::Display for DimensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DimensionClass {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DimensionClass::from(s.to_string()))
    }
}

impl From<String> for DimensionClass {
    fn from(s: String) -> Self {
        match s.as_str() {
            "query_fingerprint" => DimensionClass::QueryFingerprint,
            "table" => DimensionClass::Table,
            "user" => DimensionClass::User,
            "statement_type" => DimensionClass::StatementType,
            "database" => DimensionClass::Database,
            "wait_event" => DimensionClass::WaitEvent,
            "backend_type" => DimensionClass::BackendType,
            _ => DimensionClass::Custom(s),
        }
    }
}

impl From<DimensionClass> for String {
    fn from(class: DimensionClass) -> Self {
        match class {
            DimensionClass::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// A dimension value qualified by its class, as carried by a sample before
/// the limiter resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionKey {
    /// Class of the value
    pub class: DimensionClass,
    /// Raw value
    pub value: String,
}

impl DimensionKey {
    /// Create a new dimension key.
    pub fn new(class: DimensionClass, value: impl Into<String>) -> Self {
        Self {
            class,
            value: value.into(),
        }
    }

    /// Attribute key the resolved value is exported under.
    pub fn attribute_key(&self) -> &str {
        self.class.attribute_key()
    }
}
