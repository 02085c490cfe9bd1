//! Per-provider circuit breaker. Three states, same shape as
//! `route_quality/mitigation.rs::CircuitBreaker`/`CircuitState`, generalized
//! from "per endpoint" to "per provider" and re-parameterized to spec.md
//! §4.3's failure_threshold=5 / recovery_timeout=60s / half_open_max_calls=3.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const FAILURE_THRESHOLD: u32 = 5;
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const HALF_OPEN_MAX_CALLS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }
}

/// One breaker per provider; the router keeps these behind a registry-level
/// map so each provider's transitions serialize independently (spec.md §5:
/// "one mutex per breaker is sufficient; no global lock across providers").
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl CircuitBreaker {
    /// Moves `OPEN -> HALF_OPEN` if the recovery timeout has elapsed, then
    /// reports whether a request may proceed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= RECOVERY_TIMEOUT {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= HALF_OPEN_MAX_CALLS {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::default();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let breaker = CircuitBreaker::default();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        {
            let mut inner = breaker.inner.lock();
            inner.opened_at = Some(Instant::now() - RECOVERY_TIMEOUT - Duration::from_secs(1));
        }
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        for _ in 0..HALF_OPEN_MAX_CALLS {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::default();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        {
            let mut inner = breaker.inner.lock();
            inner.opened_at = Some(Instant::now() - RECOVERY_TIMEOUT - Duration::from_secs(1));
        }
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
