//! Circuit breaker for export targets.
//!
//! Each export target owns one breaker. After `failure_threshold`
//! consecutive failures the circuit opens and calls to the target are
//! skipped until the cooldown elapses. The next call is then let through as
//! the single half-open trial: success closes the circuit, failure re-opens
//! it with a longer cooldown, capped at `max_cooldown`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::application::ports::Clock;
use crate::error::ConfigError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through normally
    Closed = 0,
    /// Calls are rejected until the cooldown elapses
    Open = 1,
    /// One trial call is allowed to probe recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Cooldown after the first opening
    #[serde(with = "crate::config::duration_serde")]
    pub cooldown: Duration,
    /// Factor applied to the cooldown after each failed trial
    pub backoff_multiplier: f64,
    /// Upper bound on the cooldown
    #[serde(with = "crate::config::duration_serde")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// # Errors
    /// Returns [`ConfigError`] if the threshold or cooldown is zero, the
    /// multiplier is below 1, or the cap is below the base cooldown.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroCount {
                field: "circuit_breaker.failure_threshold".to_string(),
            });
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "circuit_breaker.cooldown".to_string(),
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "circuit_breaker.backoff_multiplier".to_string(),
                reason: format!("must be at least 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.max_cooldown < self.cooldown {
            return Err(ConfigError::OutOfRange {
                field: "circuit_breaker.max_cooldown".to_string(),
                reason: "must not be shorter than cooldown".to_string(),
            });
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    /// Cooldown that applies to the current or next opening, in ms
    pub cooldown_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// Circuit breaker protecting one export target.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    open_until_nanos: AtomicU64,
    cooldown_nanos: AtomicU64,
    trial_in_flight: AtomicBool,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    /// Reference point for stored deadlines
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a circuit breaker reading time from `clock`.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            open_until_nanos: AtomicU64::new(0),
            cooldown_nanos: AtomicU64::new(duration_nanos(config.cooldown)),
            trial_in_flight: AtomicBool::new(false),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            epoch: clock.now(),
            config,
            clock,
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Check whether a call may proceed.
    ///
    /// In the open state this returns `false` until the cooldown has
    /// elapsed; the first caller after that becomes the half-open trial.
    /// While the trial is in flight every other caller is rejected.
    pub fn allow_request(&self) -> bool {
        let allowed = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.now_nanos() >= self.open_until_nanos.load(Ordering::Acquire)
                    && self.acquire_trial()
                {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    tracing::debug!("circuit half-open, allowing trial request");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.acquire_trial(),
        };

        if !allowed {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    fn acquire_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.cooldown_nanos
                    .store(duration_nanos(self.config.cooldown), Ordering::Release);
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                tracing::info!("circuit closed after successful trial");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures >= u64::from(self.config.failure_threshold) {
                    let cooldown = self.cooldown_nanos.load(Ordering::Acquire);
                    self.open_until_nanos
                        .store(self.now_nanos().saturating_add(cooldown), Ordering::Release);
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Closed as u8,
                            CircuitState::Open as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::warn!(
                            consecutive_failures = failures,
                            cooldown_ms = cooldown / 1_000_000,
                            "circuit opened"
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                let current = self.cooldown_nanos.load(Ordering::Acquire);
                let next = ((current as f64) * self.config.backoff_multiplier)
                    .min(duration_nanos(self.config.max_cooldown) as f64)
                    as u64;
                self.cooldown_nanos.store(next, Ordering::Release);
                self.open_until_nanos
                    .store(self.now_nanos().saturating_add(next), Ordering::Release);
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                tracing::warn!(cooldown_ms = next / 1_000_000, "trial failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Give up a half-open trial that ended without a result, so the next
    /// caller may probe again.
    pub fn release_trial(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    /// Return to the closed state with all counters cleared.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.open_until_nanos.store(0, Ordering::Release);
        self.cooldown_nanos
            .store(duration_nanos(self.config.cooldown), Ordering::Release);
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Cooldown that applies to the current or next opening.
    pub fn current_cooldown(&self) -> Duration {
        Duration::from_nanos(self.cooldown_nanos.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            cooldown_ms: u64::try_from(self.current_cooldown().as_millis()).unwrap_or(u64::MAX),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn now_nanos(&self) -> u64 {
        duration_nanos(self.clock.now().saturating_duration_since(self.epoch))
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
