//! Per-host admission control.
//!
//! Every outbound fetch asks this module first. Each host gets a token
//! bucket (steady-state rate limiting) and a circuit breaker (fault
//! isolation); both live behind one lock and share one [`Clock`] so tests
//! drive them deterministically.
//!
//! - **Bucket**: `capacity` tokens, refilled at `refill_per_second`. An empty
//!   bucket yields a `RetryAfter` hint equal to the time until the next
//!   token; the caller may sleep or abandon.
//! - **Breaker**: 3 failures inside a rolling 60 s window open the circuit
//!   for 60 s; after that exactly one probe is admitted. Probe success
//!   closes the circuit, failure re-opens it. Timeouts count as failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};

pub mod breaker;
pub mod bucket;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use bucket::{BucketConfig, TokenBucket};

/// Result of asking for admission to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead; the caller must later call [`HostAdmission::record`].
    Granted,
    /// Bucket empty; next token expected after the given duration.
    RetryAfter(Duration),
    /// Circuit open (or half-open probe slot taken); do not call.
    CircuitOpen,
}

/// Terminal classification of one admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct HostState {
    bucket: TokenBucket,
    breaker: CircuitBreaker,
}

/// Admission gate keyed by resolved host.
///
/// Cloneable handle; all clones share state.
#[derive(Clone)]
pub struct HostAdmission {
    inner: Arc<Inner>,
}

struct Inner {
    hosts: Mutex<HashMap<String, HostState>>,
    bucket_config: BucketConfig,
    breaker_config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl Default for HostAdmission {
    fn default() -> Self {
        Self::new(BucketConfig::default(), BreakerConfig::default())
    }
}

impl HostAdmission {
    pub fn new(bucket_config: BucketConfig, breaker_config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                hosts: Mutex::new(HashMap::new()),
                bucket_config,
                breaker_config,
                clock: Arc::new(MonotonicClock::default()),
            }),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        let inner = Inner {
            hosts: Mutex::new(HashMap::new()),
            bucket_config: self.inner.bucket_config,
            breaker_config: self.inner.breaker_config,
            clock: Arc::new(clock),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Ask to talk to `host`. The breaker is consulted before the bucket so
    /// an open circuit never consumes tokens.
    pub fn acquire(&self, host: &str) -> Admission {
        let now = self.inner.clock.now_millis();
        let mut hosts = self.lock_hosts();
        let state = self.host_entry(&mut hosts, host);

        match state.breaker.gate(now) {
            breaker::Gate::Refuse { retry_in } => {
                tracing::debug!(host, retry_in_ms = retry_in.as_millis() as u64, "circuit refused");
                Admission::CircuitOpen
            }
            breaker::Gate::Allow { probe } => match state.bucket.try_acquire(now) {
                Ok(()) => {
                    if probe {
                        state.breaker.begin_probe(now);
                    }
                    Admission::Granted
                }
                Err(retry_after) => Admission::RetryAfter(retry_after),
            },
        }
    }

    /// Feed the terminal outcome of an admitted request back into the
    /// breaker. Timeouts count as failures.
    pub fn record(&self, host: &str, outcome: Outcome) {
        let now = self.inner.clock.now_millis();
        let mut hosts = self.lock_hosts();
        let state = self.host_entry(&mut hosts, host);
        match outcome {
            Outcome::Success => state.breaker.record_success(now),
            Outcome::Failure | Outcome::Timeout => {
                state.breaker.record_failure(now);
                if state.breaker.state() == CircuitState::Open {
                    tracing::warn!(host, "circuit open");
                }
            }
        }
    }

    /// Current breaker state for a host, if it has been seen.
    pub fn breaker_state(&self, host: &str) -> Option<CircuitState> {
        self.lock_hosts().get(host).map(|s| s.breaker.state())
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostState>> {
        self.inner.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn host_entry<'a>(
        &self,
        hosts: &'a mut HashMap<String, HostState>,
        host: &str,
    ) -> &'a mut HostState {
        hosts.entry(host.to_string()).or_insert_with(|| HostState {
            bucket: TokenBucket::new(self.inner.bucket_config, self.inner.clock.now_millis()),
            breaker: CircuitBreaker::new(self.inner.breaker_config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn admission_with_clock(clock: ManualClock) -> HostAdmission {
        HostAdmission::new(BucketConfig::default(), BreakerConfig::default()).with_clock(clock)
    }

    #[test]
    fn grants_within_bucket_capacity() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock);

        for _ in 0..10 {
            assert_eq!(admission.acquire("a.example"), Admission::Granted);
        }
        assert!(matches!(admission.acquire("a.example"), Admission::RetryAfter(_)));
    }

    #[test]
    fn hosts_are_isolated() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock);

        for _ in 0..10 {
            assert_eq!(admission.acquire("a.example"), Admission::Granted);
        }
        assert!(matches!(admission.acquire("a.example"), Admission::RetryAfter(_)));
        assert_eq!(admission.acquire("b.example"), Admission::Granted);
    }

    #[test]
    fn retry_after_reflects_refill_rate() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..10 {
            let _ = admission.acquire("a.example");
        }
        let hint = match admission.acquire("a.example") {
            Admission::RetryAfter(d) => d,
            other => panic!("expected RetryAfter, got {other:?}"),
        };
        // refill=5/s, so the next token is at most 200ms away
        assert!(hint <= Duration::from_millis(200));
        assert!(hint > Duration::ZERO);

        clock.advance(200);
        assert_eq!(admission.acquire("a.example"), Admission::Granted);
    }

    #[test]
    fn three_failures_open_the_circuit() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..3 {
            assert_eq!(admission.acquire("slow.example"), Admission::Granted);
            admission.record("slow.example", Outcome::Timeout);
        }
        assert_eq!(admission.breaker_state("slow.example"), Some(CircuitState::Open));
        assert_eq!(admission.acquire("slow.example"), Admission::CircuitOpen);

        // Still refused until the open window elapses
        clock.advance(59_999);
        assert_eq!(admission.acquire("slow.example"), Admission::CircuitOpen);

        clock.advance(1);
        assert_eq!(admission.acquire("slow.example"), Admission::Granted);
        assert_eq!(admission.breaker_state("slow.example"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..3 {
            let _ = admission.acquire("h.example");
            admission.record("h.example", Outcome::Failure);
        }
        clock.advance(60_000);

        assert_eq!(admission.acquire("h.example"), Admission::Granted);
        assert_eq!(admission.acquire("h.example"), Admission::CircuitOpen);

        admission.record("h.example", Outcome::Success);
        assert_eq!(admission.breaker_state("h.example"), Some(CircuitState::Closed));
        assert_eq!(admission.acquire("h.example"), Admission::Granted);
    }

    #[test]
    fn failed_probe_reopens() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..3 {
            let _ = admission.acquire("h.example");
            admission.record("h.example", Outcome::Failure);
        }
        clock.advance(60_000);
        let _ = admission.acquire("h.example");
        admission.record("h.example", Outcome::Failure);

        assert_eq!(admission.breaker_state("h.example"), Some(CircuitState::Open));
        assert_eq!(admission.acquire("h.example"), Admission::CircuitOpen);
    }

    #[test]
    fn success_resets_the_failure_window() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..2 {
            let _ = admission.acquire("h.example");
            admission.record("h.example", Outcome::Failure);
        }
        let _ = admission.acquire("h.example");
        admission.record("h.example", Outcome::Success);

        // Two more failures do not trip the threshold after the reset
        for _ in 0..2 {
            let _ = admission.acquire("h.example");
            admission.record("h.example", Outcome::Failure);
        }
        assert_eq!(admission.breaker_state("h.example"), Some(CircuitState::Closed));
    }

    #[test]
    fn stale_failures_age_out_of_the_window() {
        let clock = ManualClock::new();
        let admission = admission_with_clock(clock.clone());

        for _ in 0..2 {
            let _ = admission.acquire("h.example");
            admission.record("h.example", Outcome::Failure);
        }
        // Third failure lands outside the 60s window and starts a new one
        clock.advance(61_000);
        let _ = admission.acquire("h.example");
        admission.record("h.example", Outcome::Failure);

        assert_eq!(admission.breaker_state("h.example"), Some(CircuitState::Closed));
    }
}
