//! Error taxonomy for the collection engine.
//!
//! Errors are scoped to the concern that produces them. Only [`ConfigError`]
//! is fatal; everything else is contained to a single sample, source tick or
//! export target and never aborts a collection cycle.

use std::time::Duration;

use thiserror::Error;

/// A failure while delivering a batch to one export target.
///
/// Every variant counts as a failure for the target's circuit breaker. Only
/// [retryable](ExportError::is_retryable) ones are attempted again within the
/// same cycle.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The adapter did not finish within its per-target timeout.
    #[error("export timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("backend rejected batch with status {status}: {body}")]
    Rejected {
        /// HTTP (or protocol) status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// The batch could not be encoded for this backend.
    #[error("failed to encode batch: {0}")]
    Encode(String),

    /// Local sink I/O failed.
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The adapter task panicked or was cancelled by the runtime.
    #[error("export task aborted: {0}")]
    Aborted(String),
}

impl ExportError {
    /// Short machine-friendly label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Timeout(_) => "timeout",
            ExportError::Transport(_) => "transport",
            ExportError::Rejected { .. } => "rejected",
            ExportError::Encode(_) => "encode",
            ExportError::Io(_) => "io",
            ExportError::Aborted(_) => "aborted",
        }
    }

    /// Whether sending the same batch again could succeed.
    ///
    /// Client errors other than `408` and `429` and encoding failures are
    /// permanent for this batch.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Rejected { status, .. } => {
                !(400..500).contains(status) || matches!(status, 408 | 429)
            }
            ExportError::Encode(_) => false,
            _ => true,
        }
    }
}

/// The target's breaker is open; the call was skipped without contacting the
/// backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for export target `{target}`")]
pub struct CircuitOpenError {
    /// Name of the skipped target
    pub target: String,
}

/// Invalid configuration. Detected before the first cycle and fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_tracked` must allow at least one tracked value.
    #[error("max_tracked for dimension class `{class}` must be greater than 0")]
    ZeroMaxTracked {
        /// Offending class
        class: String,
    },

    /// A rate or probability outside `[0, 1]`.
    #[error("{field} must be within [0.0, 1.0], got {value}")]
    InvalidRate {
        /// Offending setting
        field: String,
        /// Supplied value
        value: f64,
    },

    /// A duration that must be positive was zero.
    #[error("{field} must be greater than 0")]
    ZeroDuration {
        /// Offending setting
        field: String,
    },

    /// A count or capacity that must be positive was zero.
    #[error("{field} must be greater than 0")]
    ZeroCount {
        /// Offending setting
        field: String,
    },

    /// A multiplier or factor outside its allowed range.
    #[error("{field} is out of range: {reason}")]
    OutOfRange {
        /// Offending setting
        field: String,
        /// What the constraint is
        reason: String,
    },

    /// A sampling rule is malformed.
    #[error("sampling rule `{rule}` is invalid: {reason}")]
    InvalidRule {
        /// Rule name
        rule: String,
        /// What is wrong with it
        reason: String,
    },

    /// Two export targets share a name.
    #[error("duplicate export target name `{0}`")]
    DuplicateTarget(String),

    /// An export target is missing a required setting.
    #[error("export target `{target}` is invalid: {reason}")]
    InvalidTarget {
        /// Target name
        target: String,
        /// What is wrong with it
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An address could not be parsed.
    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),

    /// A custom dimension class would overwrite an attribute the engine sets.
    #[error("dimension class `{0}` uses a reserved attribute name")]
    ReservedDimension(String),
}

/// A raw sample failed validation and was discarded.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleError {
    /// Durations are milliseconds and must be finite and non-negative.
    #[error("invalid duration: {0} ms")]
    InvalidDuration(f64),

    /// Measurement values must be finite and non-negative.
    #[error("invalid value for measurement `{name}`: {value}")]
    InvalidMeasurement {
        /// Measurement name
        name: String,
        /// Rejected value
        value: f64,
    },

    /// A custom dimension would overwrite an attribute the engine sets.
    #[error("dimension `{0}` uses a reserved attribute name")]
    ReservedDimension(String),
}

/// A sample or session producer failed for one tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The upstream database was unreachable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The upstream query failed.
    #[error("source query failed: {0}")]
    Query(String),
}

/// The engine did not stop cleanly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShutdownError {
    /// Background tasks were still running when the grace period ended;
    /// they have been aborted.
    #[error("{0} engine task(s) did not stop within the shutdown grace period")]
    Timeout(usize),

    /// A background task panicked.
    #[error("engine task panicked: {0}")]
    TaskPanicked(String),
}
