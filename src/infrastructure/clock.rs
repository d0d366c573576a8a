//! Clock adapters for time operations.
//!
//! Circuit breakers read time through the [`Clock`] port so that cooldowns
//! can be stepped deterministically in tests with `MockClock` (in
//! `crate::infrastructure::mocks`, available with the `test-helpers`
//! feature or in test builds).

use std::time::Instant;

use crate::application::ports::Clock;

/// Monotonic system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
