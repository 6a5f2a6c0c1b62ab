//! Waiting between fetch attempts, abstracted so tests never block.
//!
//! The fetcher is the only sleeper client: it waits out backoff delays and
//! rate-limit hints. Production uses the tokio timer; tests use
//! [`VirtualSleeper`], which completes immediately, records every requested
//! delay, and can drive a [`ManualClock`] forward by the same amount so
//! bucket refill and breaker recovery play out in virtual time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::ManualClock;

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that returns immediately.
///
/// Every requested delay is recorded for assertions. Built with
/// [`VirtualSleeper::driving`], the linked clock advances by each requested
/// delay, so time-window logic downstream of the wait observes it.
#[derive(Debug, Clone, Default)]
pub struct VirtualSleeper {
    clock: Option<ManualClock>,
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl VirtualSleeper {
    /// Sleeper that swallows delays without touching any clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeper that advances `clock` by every requested delay.
    pub fn driving(clock: ManualClock) -> Self {
        Self { clock: Some(clock), waits: Arc::default() }
    }

    /// Delays requested so far, in order.
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for VirtualSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Some(clock) = &self.clock {
            clock.advance(duration.as_millis() as u64);
        }
        self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn tokio_sleeper_actually_sleeps() {
        let sleeper = TokioSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        // Small tolerance for timer granularity
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn virtual_sleeper_returns_immediately_and_records() {
        let sleeper = VirtualSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(10)).await;
        sleeper.sleep(Duration::from_secs(20)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[tokio::test]
    async fn driving_sleeper_advances_the_clock() {
        let clock = ManualClock::new();
        let sleeper = VirtualSleeper::driving(clock.clone());

        sleeper.sleep(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_millis(), 1_500);

        sleeper.sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now_millis(), 2_000);
        assert_eq!(sleeper.waits().len(), 2);
    }

    #[tokio::test]
    async fn detached_sleeper_leaves_clocks_alone() {
        let clock = ManualClock::new();
        let sleeper = VirtualSleeper::new();
        sleeper.sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now_millis(), 0);
    }
}
