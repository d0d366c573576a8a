//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides:
//! - Export adapters (JSON lines, OTLP/HTTP)
//! - Engine construction from configuration
//! - Clock abstraction (system time vs mock)
//! - The HTTP health endpoint (feature `health-server`)

pub mod adapters;
pub mod builder;
pub mod clock;

#[cfg(feature = "health-server")]
pub mod health_server;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides scripted sources and adapters, a
/// controllable clock and a capturing tracing layer.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// collection-engine = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
