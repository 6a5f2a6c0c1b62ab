//! Jitter strategies to keep retrying fetchers from stampeding a host.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter - use exact backoff delay.
    None,
    /// Full jitter: random between 0 and delay.
    Full,
    /// Equal jitter: random between delay/2 and delay.
    Equal,
    /// Proportional jitter: random within ±fraction of the delay.
    Proportional { fraction: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Jitter within ±`fraction` of the base delay (`0.2` = ±20 %).
    pub fn proportional(fraction: f64) -> Self {
        Jitter::Proportional { fraction: fraction.clamp(0.0, 1.0) }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.gen_range(half..=millis))
            }
            Jitter::Proportional { fraction } => {
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let spread = (millis as f64 * fraction).round() as u64;
                if spread == 0 {
                    return delay;
                }
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.gen_range(low..=high))
            }
        }
    }
}
