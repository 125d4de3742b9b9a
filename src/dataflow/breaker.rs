//! Per-channel circuit breaker (spec §4.3): opens after N consecutive
//! failures, skips the channel for a cooldown, then lets one probe
//! record through to decide whether to close again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    /// Set while a half-open probe is in flight so only the caller that
    /// flips it gets to be the probe; everyone else is turned away until
    /// that probe resolves (spec §4.3 "one probe record").
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            inner: Mutex::new(Inner { state: BreakerState::Closed, opened_at: None, probe_in_flight: false }),
        }
    }

    /// Whether a record may be submitted right now. `false` means the
    /// channel should be treated as a dead-end for this record (spec
    /// §4.3 "records destined only for it are dropped"). In `HalfOpen`,
    /// exactly one caller consumes the probe slot; every other caller is
    /// turned away until `record_success`/`record_failure` resolves it.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let elapsed_enough = inner.opened_at.is_some_and(|t| t.elapsed() >= self.cooldown);
                if elapsed_enough {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, BreakerState::Open)
    }

    /// Returns `true` if this call transitioned the breaker Closed->Open
    /// (the manager counts `circuit_opens` only on that edge).
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                // The probe failed: back to Open without waiting on the
                // threshold, since the failure streak that opened it
                // originally was never reset.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                false
            }
            BreakerState::Open => false,
            BreakerState::Closed => {
                if failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_in_flight = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn success_resets_failure_count_and_closes() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_probe_after_cooldown_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow()); // cooldown elapsed -> half-open probe allowed
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_grants_the_probe_to_only_one_of_many_concurrent_callers() {
        use std::sync::Arc;

        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(5)));
        assert!(breaker.record_failure());
        std::thread::sleep(Duration::from_millis(10));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.allow())
            })
            .collect();
        let grants = handles.into_iter().filter_map(|h| h.join().ok()).filter(|&granted| granted).count();
        assert_eq!(grants, 1);
    }
}
