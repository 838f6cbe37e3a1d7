//! A three-state fault gate guarding the partitioner and `update_leader`
//! calls (spec.md §4.2, §4.3): 3 failures to open, 1 success to close, a
//! 10-second cool-off before a half-open probe is allowed through.
//!
//! Adapted from the atomics-based breaker used elsewhere in this codebase's
//! lineage for guarding flaky downstream calls, generalized here into a
//! small reusable gate rather than a bespoke per-call-site implementation.

use std::{
    sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Number of consecutive failures that trip the breaker from closed to
/// open.
pub const FAILURE_THRESHOLD: usize = 3;
/// Number of successes while half-open required to close the breaker
/// again.
pub const SUCCESS_THRESHOLD: usize = 1;
/// How long the breaker stays open before allowing a half-open probe.
pub const COOL_OFF: Duration = Duration::from_secs(10);

/// A gate that tracks recent failures of a guarded operation and stops
/// calling it for a cool-off period once failures cross a threshold.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    started_at: Instant,
}

impl CircuitBreaker {
    /// Creates a new breaker in the closed state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicUsize::new(0),
            success_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Whether a call is currently allowed through. Transitions
    /// open -> half-open once the cool-off has elapsed.
    pub fn allow(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            HALF_OPEN => true,
            OPEN => {
                let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                let elapsed = self.started_at.elapsed().as_millis() as u64;
                if elapsed.saturating_sub(opened_at) >= COOL_OFF.as_millis() as u64 {
                    self.state.store(HALF_OPEN, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!("circuit breaker state is one of CLOSED, OPEN, HALF_OPEN"),
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            CLOSED => {
                self.failure_count.store(0, Ordering::Release);
            }
            HALF_OPEN => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= SUCCESS_THRESHOLD {
                    self.state.store(CLOSED, Ordering::Release);
                    self.failure_count.store(0, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                }
            }
            _ => {}
        }
    }

    /// Records a failed call, tripping the breaker open if the threshold is
    /// crossed (or immediately, from half-open).
    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            CLOSED => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= FAILURE_THRESHOLD {
                    self.open();
                }
            }
            HALF_OPEN => self.open(),
            _ => {
                let _ = self.failure_count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn open(&self) {
        self.state.store(OPEN, Ordering::Release);
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.opened_at_millis.store(elapsed, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert!(!breaker.allow());

        // Force the cool-off to have elapsed.
        breaker.opened_at_millis.store(0, Ordering::Release);
        assert!(breaker.allow());
        breaker.record_success();

        breaker.record_failure();
        assert!(!breaker.allow());
    }
}
