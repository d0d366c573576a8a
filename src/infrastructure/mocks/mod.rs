//! Test doubles for the engine's ports.
//!
//! Available in test builds and with the `test-helpers` feature.

pub mod adapter;
pub mod clock;
pub mod layer;
pub mod source;

pub use adapter::{MockAdapter, MockResponse};
pub use clock::MockClock;
pub use layer::{CapturedEvent, MockCaptureLayer};
pub use source::{MockSampleSource, MockSessionSource};
