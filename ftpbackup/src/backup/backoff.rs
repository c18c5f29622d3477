use rand::Rng;
use std::time::Duration;

/// Delay between transfer attempts.
///
/// The delay doubles after each failed attempt up to `max`. With
/// `base == max` and no jitter it is constant, which is the default retry
/// behaviour for downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, false)
    }

    /// Delay to wait after failed attempt number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if self.jitter {
            self.delay_with_rng(retry, &mut rand::thread_rng())
        } else {
            Duration::from_millis(self.grown_ms(retry))
        }
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let grown = self.grown_ms(retry);
        if self.jitter && grown > 0 {
            Duration::from_millis(rng.gen_range(grown / 2..=grown))
        } else {
            Duration::from_millis(grown)
        }
    }

    fn grown_ms(&self, retry: u32) -> u64 {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        base_ms.saturating_mul(1u64 << retry.min(16)).min(max_ms)
    }
}
