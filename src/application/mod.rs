//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Cardinality limiting (per-class Space-Saving trackers)
//! - Adaptive sampling
//! - Sample to metric conversion
//! - Active Session History
//! - Export fan-out with per-target circuit breakers
//! - The engine runtime and its health surface
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters and embedding applications implement. This keeps the
//! application layer independent from database drivers and wire formats.

pub mod ash;
pub mod cardinality;
pub mod circuit_breaker;
pub mod engine;
pub mod export;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod sampler;
