//! Consecutive-failure circuit breaker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

use super::CircuitBreakerCheck;

/// Default number of consecutive failures that opens the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Opens after `threshold` consecutive failures; the next success closes it.
///
/// Share it behind an `Arc` and hand [`ConsecutiveFailureBreaker::check`] to a
/// [`RequestScheduler`](super::RequestScheduler).
#[derive(Debug)]
pub struct ConsecutiveFailureBreaker {
    threshold: u32,
    failures: AtomicU32,
}

impl Default for ConsecutiveFailureBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl ConsecutiveFailureBreaker {
    /// Creates a closed breaker. A threshold of 0 is treated as 1.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: AtomicU32::new(0),
        }
    }

    /// Records a successful call, closing the circuit.
    pub fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        if previous >= self.threshold {
            info!(previous_failures = previous, "circuit closed");
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if failures == self.threshold {
            warn!(failures, "circuit opened after consecutive failures");
        }
    }

    /// Returns true while the circuit is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::SeqCst) >= self.threshold
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Returns a predicate suitable for [`RequestScheduler::new`](super::RequestScheduler::new).
    #[must_use]
    pub fn check(self: &Arc<Self>) -> CircuitBreakerCheck {
        let breaker = Arc::clone(self);
        Arc::new(move || breaker.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = ConsecutiveFailureBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = ConsecutiveFailureBreaker::new(2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_check_reflects_state() {
        let breaker = Arc::new(ConsecutiveFailureBreaker::new(1));
        let check = breaker.check();
        assert!(!check());

        breaker.record_failure();
        assert!(check());
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let breaker = ConsecutiveFailureBreaker::new(0);
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}
