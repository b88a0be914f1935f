/* src/breaker.rs */

//! Per-route circuit breaker.
//!
//! Outcomes are aggregated over a fixed window of `interval`. While Closed
//! the counters reset at every window roll, and the breaker trips once
//! `requests >= min_requests` and `failures / requests >= failure_ratio`.
//! Open rejects everything until `timeout` has elapsed, then a single probe
//! is let through in HalfOpen: success closes, failure reopens.

use crate::clock::Clock;
use crate::models::CircuitBreakerSpec;
use fancy_log::{LogLevel, log};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window_start: u64,
    requests: u32,
    failures: u32,
    opened_at: u64,
    probes_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_ratio: f64,
    min_requests: u32,
    interval_ms: u64,
    timeout_ms: u64,
    half_open_max: u32,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, spec: &CircuitBreakerSpec, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            name: name.to_owned(),
            failure_ratio: spec.failure_ratio,
            min_requests: spec.min_requests.max(1),
            interval_ms: spec.interval_sec.saturating_mul(1000),
            timeout_ms: spec.timeout_sec.saturating_mul(1000),
            half_open_max: 1,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window_start: now,
                requests: 0,
                failures: 0,
                opened_at: 0,
                probes_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying any time-driven transition first.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.advance(&mut inner, self.clock.now_millis());
        inner.state
    }

    /// Asks for permission to dispatch. `None` means the breaker rejects the
    /// request; the caller must not dispatch.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        self.advance(&mut inner, self.clock.now_millis());
        match inner.state {
            BreakerState::Closed => Some(BreakerPermit { breaker: self, probe: false, done: false }),
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                if inner.probes_in_flight >= self.half_open_max {
                    return None;
                }
                inner.probes_in_flight += 1;
                Some(BreakerPermit { breaker: self, probe: true, done: false })
            }
        }
    }

    /// Rolls the window while Closed and moves Open to HalfOpen once the
    /// timeout has passed.
    fn advance(&self, inner: &mut Inner, now: u64) {
        match inner.state {
            BreakerState::Closed => {
                if self.interval_ms > 0 && now.saturating_sub(inner.window_start) >= self.interval_ms {
                    let elapsed = now - inner.window_start;
                    inner.window_start = now - elapsed % self.interval_ms;
                    inner.requests = 0;
                    inner.failures = 0;
                }
            }
            BreakerState::Open => {
                if now.saturating_sub(inner.opened_at) >= self.timeout_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 0;
                    log(
                        LogLevel::Info,
                        &format!("Circuit breaker for route '{}' -> half-open", self.name),
                    );
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn record(&self, probe: bool, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        self.advance(&mut inner, now);

        match inner.state {
            BreakerState::Closed => {
                inner.requests += 1;
                if !success {
                    inner.failures += 1;
                }
                let ratio = f64::from(inner.failures) / f64::from(inner.requests);
                if inner.requests >= self.min_requests && ratio >= self.failure_ratio {
                    log(
                        LogLevel::Warn,
                        &format!(
                            "Circuit breaker for route '{}' -> open ({}/{} failed)",
                            self.name, inner.failures, inner.requests
                        ),
                    );
                    Self::trip(&mut inner, now);
                }
            }
            BreakerState::HalfOpen if probe => {
                if success {
                    inner.state = BreakerState::Closed;
                    inner.window_start = now;
                    inner.requests = 0;
                    inner.failures = 0;
                    log(
                        LogLevel::Info,
                        &format!("Circuit breaker for route '{}' -> closed", self.name),
                    );
                } else {
                    log(
                        LogLevel::Warn,
                        &format!("Circuit breaker for route '{}': probe failed -> open", self.name),
                    );
                    Self::trip(&mut inner, now);
                }
            }
            // Late outcomes from requests admitted before the trip.
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn trip(inner: &mut Inner, now: u64) {
        inner.state = BreakerState::Open;
        inner.opened_at = now;
        inner.probes_in_flight = 0;
        inner.requests = 0;
        inner.failures = 0;
    }
}

/// Admission granted by [`CircuitBreaker::acquire`]. Report the outcome with
/// [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
/// unreported (client went away) only releases a half-open probe slot.
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    done: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.done = true;
        self.breaker.record(self.probe, true);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.breaker.record(self.probe, false);
    }

    pub fn report(self, success: bool) {
        if success { self.success() } else { self.failure() }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.done && self.probe {
            let mut inner = self.breaker.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn spec(min_requests: u32, failure_ratio: f64, interval_sec: u64, timeout_sec: u64) -> CircuitBreakerSpec {
        CircuitBreakerSpec { enabled: true, failure_ratio, min_requests, interval_sec, timeout_sec }
    }

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("r", &spec(5, 0.5, 10, 5), clock.clone())
    }

    #[test]
    fn trips_after_min_requests_with_enough_failures() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for ok in [true, true, false, false, false] {
            cb.acquire().unwrap().report(ok);
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.acquire().is_none());
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for _ in 0..4 {
            cb.acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn stays_closed_below_ratio() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for ok in [true, true, true, false, false] {
            cb.acquire().unwrap().report(ok);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn window_roll_resets_counters() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for _ in 0..4 {
            cb.acquire().unwrap().failure();
        }
        clock.advance(Duration::from_secs(10));
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn open_rejects_until_timeout_then_probes() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.acquire().unwrap().failure();
        }
        clock.advance(Duration::from_millis(4_999));
        assert!(cb.acquire().is_none());
        clock.advance(Duration::from_millis(1));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let probe = cb.acquire().expect("probe allowed");
        assert!(cb.acquire().is_none(), "only one probe at a time");
        probe.success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.acquire().unwrap().failure();
        }
        clock.advance(Duration::from_secs(5));
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);
        clock.advance(Duration::from_secs(4));
        assert!(cb.acquire().is_none());
    }

    #[test]
    fn dropped_probe_frees_the_slot() {
        let clock = ManualClock::shared();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.acquire().unwrap().failure();
        }
        clock.advance(Duration::from_secs(5));
        drop(cb.acquire().unwrap());
        assert!(cb.acquire().is_some());
    }
}
