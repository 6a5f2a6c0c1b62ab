//! Circuit breaker with a rolling failure window and half-open recovery.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that trip the breaker.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub failure_window: Duration,
    /// How long an open circuit refuses before probing.
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            open_for: Duration::from_secs(60),
        }
    }
}

/// Gate decision for one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    /// Proceed. `probe` is set when this would be the single half-open probe;
    /// the caller commits it via [`CircuitBreaker::begin_probe`] once the
    /// rate limiter has also agreed.
    Allow { probe: bool },
    /// Refuse without touching the host.
    Refuse { retry_in: Duration },
}

/// Breaker for one host. Not synchronized; callers hold the admission lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    window_started_at: u64,
    opened_at: u64,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            window_started_at: 0,
            opened_at: 0,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn gate(&mut self, now_millis: u64) -> Gate {
        match self.state {
            CircuitState::Closed => Gate::Allow { probe: false },
            CircuitState::Open => {
                let open_for = self.config.open_for.as_millis() as u64;
                let elapsed = now_millis.saturating_sub(self.opened_at);
                if elapsed >= open_for {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = false;
                    tracing::info!("circuit half-open");
                    Gate::Allow { probe: true }
                } else {
                    Gate::Refuse { retry_in: Duration::from_millis(open_for - elapsed) }
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Gate::Refuse { retry_in: Duration::ZERO }
                } else {
                    Gate::Allow { probe: true }
                }
            }
        }
    }

    /// Commit the single half-open probe slot.
    pub(crate) fn begin_probe(&mut self, _now_millis: u64) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = true;
        }
    }

    pub fn record_success(&mut self, _now_millis: u64) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.probe_in_flight = false;
                tracing::info!("circuit closed");
            }
            CircuitState::Closed => {
                // Success resets the failure window
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now_millis: u64) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = now_millis;
                self.probe_in_flight = false;
            }
            CircuitState::Closed => {
                let window = self.config.failure_window.as_millis() as u64;
                if self.failure_count == 0
                    || now_millis.saturating_sub(self.window_started_at) > window
                {
                    self.failure_count = 1;
                    self.window_started_at = now_millis;
                } else {
                    self.failure_count += 1;
                }
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = now_millis;
                }
            }
            CircuitState::Open => {}
        }
    }
}
