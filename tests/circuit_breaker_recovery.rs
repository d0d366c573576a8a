use std::sync::Arc;
use std::time::{Duration, Instant};

use collection_engine::infrastructure::mocks::MockClock;
use collection_engine::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

fn breaker() -> (CircuitBreaker, MockClock) {
    let clock = MockClock::new(Instant::now());
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        cooldown: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        max_cooldown: Duration::from_secs(25),
    };
    (CircuitBreaker::new(config, Arc::new(clock.clone())), clock)
}

fn fail(cb: &CircuitBreaker, times: usize) {
    for _ in 0..times {
        assert!(cb.allow_request());
        cb.record_failure();
    }
}

#[test]
fn test_full_recovery_cycle() {
    let (cb, clock) = breaker();

    fail(&cb, 2);
    assert_eq!(cb.state(), CircuitState::Closed);
    fail(&cb, 1);
    assert_eq!(cb.state(), CircuitState::Open);

    assert!(!cb.allow_request());
    clock.advance(Duration::from_secs(9));
    assert!(!cb.allow_request());

    clock.advance(Duration::from_secs(1));
    assert!(cb.allow_request());
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.consecutive_failures(), 0);
    assert!(cb.allow_request());
}

#[test]
fn test_success_resets_failure_streak() {
    let (cb, _) = breaker();

    fail(&cb, 2);
    cb.record_success();
    fail(&cb, 2);
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.consecutive_failures(), 2);
}

#[test]
fn test_failed_trial_backs_off_up_to_cap() {
    let (cb, clock) = breaker();
    fail(&cb, 3);
    assert_eq!(cb.current_cooldown(), Duration::from_secs(10));

    clock.advance(Duration::from_secs(10));
    assert!(cb.allow_request());
    cb.record_failure();
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.current_cooldown(), Duration::from_secs(20));

    clock.advance(Duration::from_secs(19));
    assert!(!cb.allow_request());
    clock.advance(Duration::from_secs(1));
    assert!(cb.allow_request());
    cb.record_failure();
    assert_eq!(cb.current_cooldown(), Duration::from_secs(25));

    // A successful trial restores the base cooldown for the next opening.
    clock.advance(Duration::from_secs(25));
    assert!(cb.allow_request());
    cb.record_success();
    fail(&cb, 3);
    assert_eq!(cb.current_cooldown(), Duration::from_secs(10));
}

#[test]
fn test_only_one_trial_in_half_open() {
    let (cb, clock) = breaker();
    fail(&cb, 3);
    clock.advance(Duration::from_secs(10));

    assert!(cb.allow_request());
    assert!(!cb.allow_request());
    assert!(!cb.allow_request());

    let snap = cb.snapshot();
    assert_eq!(snap.state, CircuitState::HalfOpen);
    assert!(snap.rejections >= 2);
}

#[test]
fn test_released_trial_can_be_retaken() {
    let (cb, clock) = breaker();
    fail(&cb, 3);
    clock.advance(Duration::from_secs(10));

    assert!(cb.allow_request());
    cb.release_trial();
    assert!(cb.allow_request());
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[test]
fn test_shared_across_threads() {
    let (cb, clock) = breaker();
    let cb = Arc::new(cb);
    fail(&cb, 3);
    clock.advance(Duration::from_secs(10));

    let admitted: usize = (0..8)
        .map(|_| {
            let cb = Arc::clone(&cb);
            std::thread::spawn(move || usize::from(cb.allow_request()))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();
    assert_eq!(admitted, 1);
}
