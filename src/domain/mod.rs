//! Domain layer - pure data and functions with no runtime dependencies.
//!
//! This layer contains the core concepts of the collection engine:
//! - Query fingerprinting
//! - Dimension classes and keys
//! - Raw samples and active sessions
//! - The canonical metric model
//! - Sampling rules
//!
//! All types in this layer are pure and easily testable.

pub mod dimension;
pub mod fingerprint;
pub mod metric;
pub mod sample;
pub mod sampling;
