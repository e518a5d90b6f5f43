//! Circuit breaker with exponential backoff for upstream connections.

use chrono::{DateTime, Utc};
use metrics::gauge;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls permitted.
    Closed,
    /// Failures exceeded the threshold, calls rejected.
    Open,
    /// Backoff elapsed, a limited number of trial calls permitted.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Point-in-time view of the breaker, used by the readiness snapshot.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_since: Option<DateTime<Utc>>,
}

struct Inner {
    state: BreakerState,
    /// Times the breaker has entered OPEN since the last full recovery.
    open_count: u32,
    opened_at: Option<Instant>,
    open_since: Option<DateTime<Utc>>,
    half_open_calls: u32,
}

/// Per-connection circuit breaker.
///
/// The breaker never retries on its own: `allow` gates attempts and the
/// caller decides what a rejection means.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    max_backoff: Duration,
    half_open_max_calls: u32,
    consecutive_failures: AtomicU32,
    inner: Mutex<Inner>,
    exchange: String,
    contract_type: String,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
        exchange: impl Into<String>,
        contract_type: impl Into<String>,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            max_backoff: Duration::from_secs(300),
            half_open_max_calls,
            consecutive_failures: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                open_count: 0,
                opened_at: None,
                open_since: None,
                half_open_calls: 0,
            }),
            exchange: exchange.into(),
            contract_type: contract_type.into(),
        }
    }

    /// Current backoff: base recovery timeout on the first open, doubling
    /// per consecutive reopen, capped at five minutes.
    pub fn backoff(&self) -> Duration {
        let open_count = self.inner.lock().unwrap().open_count;
        self.backoff_for(open_count)
    }

    fn backoff_for(&self, open_count: u32) -> Duration {
        let exponent = open_count.saturating_sub(1).min(31);
        let backoff = self.recovery_timeout * 2u32.pow(exponent);
        backoff.min(self.max_backoff)
    }

    /// Whether a call may proceed. Moves OPEN → HALF_OPEN once the
    /// backoff has elapsed and counts trial slots while HALF_OPEN.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let backoff = self.backoff_for(inner.open_count);
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(backoff);
                if elapsed >= backoff {
                    info!(
                        exchange = %self.exchange,
                        contract_type = %self.contract_type,
                        open_count = inner.open_count,
                        backoff_secs = backoff.as_secs_f64(),
                        "circuit breaker entering half-open state"
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    self.set_gauge(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. A HALF_OPEN success closes the circuit
    /// and resets the reopen count.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            info!(
                exchange = %self.exchange,
                contract_type = %self.contract_type,
                "circuit breaker trial succeeded, closing circuit"
            );
            inner.state = BreakerState::Closed;
            inner.open_count = 0;
            inner.opened_at = None;
            inner.open_since = None;
            inner.half_open_calls = 0;
            self.set_gauge(BreakerState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.open_count += 1;
                warn!(
                    exchange = %self.exchange,
                    contract_type = %self.contract_type,
                    open_count = inner.open_count,
                    next_backoff_secs = self.backoff_for(inner.open_count).as_secs_f64(),
                    "circuit breaker trial failed, reopening circuit"
                );
                self.open_locked(&mut inner);
            }
            BreakerState::Closed => {
                if failures >= self.failure_threshold {
                    inner.open_count += 1;
                    warn!(
                        exchange = %self.exchange,
                        contract_type = %self.contract_type,
                        failures,
                        backoff_secs = self.backoff_for(inner.open_count).as_secs_f64(),
                        "circuit breaker opening"
                    );
                    self.open_locked(&mut inner);
                }
            }
            BreakerState::Open => {
                // Restart the backoff clock.
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    fn open_locked(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.open_since = Some(Utc::now());
        inner.half_open_calls = 0;
        self.set_gauge(BreakerState::Open);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            open_since: inner.open_since,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    fn set_gauge(&self, state: BreakerState) {
        gauge!(
            "circuit_breaker_state",
            "exchange" => self.exchange.clone(),
            "contract_type" => self.contract_type.clone()
        )
        .set(state.gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(5, recovery, 1, "binance", "spot")
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow(), "no attempts permitted within the recovery window");
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_permits_a_single_trial() {
        let cb = breaker(Duration::from_millis(5));
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(10));
        assert!(cb.allow(), "backoff elapsed, trial permitted");
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.allow(), "only one trial call in half-open");
    }

    #[test]
    fn half_open_success_closes_and_resets_open_count() {
        let cb = breaker(Duration::from_millis(5));
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(10));
        assert!(cb.allow());
        cb.record_success();
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.open_since.is_none());
        assert_eq!(cb.backoff(), Duration::from_millis(5), "open count reset to zero");
    }

    #[test]
    fn half_open_failure_doubles_backoff() {
        let cb = breaker(Duration::from_millis(5));
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.backoff(), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.backoff(), Duration::from_millis(10), "second open doubles the wait");
    }

    #[test]
    fn backoff_is_capped() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(30), 1, "okx", "swap");
        assert_eq!(cb.backoff_for(10), Duration::from_secs(300));
        assert_eq!(cb.backoff_for(40), Duration::from_secs(300), "exponent clamp holds");
    }
}
