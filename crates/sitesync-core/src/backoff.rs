//! Retry backoff (spec §4.2): `backoff(n) = min(cap, base * 2^(n-1)) + jitter`.
//!
//! Shared by the Store's lease-reclamation path and the Task Queue's
//! `fail_transient` so both compute the same schedule from the same config.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the unjittered delay added/subtracted at random, e.g.
    /// `0.25` for ±25%.
    pub jitter_fraction: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(120),
            jitter_fraction: 0.25,
        }
    }
}

impl Backoff {
    /// `attempt` is the attempt count *after* incrementing (so the first
    /// retry after attempt 1 uses `n=1`).
    pub fn compute(&self, attempt: i64) -> Duration {
        self.compute_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn compute_with_rng(&self, attempt: i64, rng: &mut impl Rng) -> Duration {
        let n = attempt.max(1);
        let unjittered = if n - 1 >= 63 {
            self.cap
        } else {
            let scaled = self.base.as_secs_f64() * 2f64.powi((n - 1) as i32);
            Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
        };

        if self.jitter_fraction <= 0.0 {
            return unjittered;
        }

        let span = unjittered.as_secs_f64() * self.jitter_fraction;
        let delta = rng.gen_range(-span..=span);
        let jittered = (unjittered.as_secs_f64() + delta).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_and_respects_cap() {
        let b = Backoff {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(120),
            jitter_fraction: 0.0,
        };
        assert_eq!(b.compute(1), Duration::from_secs(2));
        assert_eq!(b.compute(2), Duration::from_secs(4));
        assert_eq!(b.compute(3), Duration::from_secs(8));
        assert_eq!(b.compute(20), Duration::from_secs(120));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(120),
            jitter_fraction: 0.25,
        };
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let d = b.compute_with_rng(1, &mut rng);
            assert!(d.as_secs_f64() >= 7.5 && d.as_secs_f64() <= 12.5);
        }
    }
}
