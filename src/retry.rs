// src/retry.rs
// Backoff policy for transient fetch failures: bounded attempts, exponential
// growth with a hard cap, plus random jitter so a burst of failing sources
// does not retry in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failed attempt is `backoff_delay(1)`).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Upper bound on how long the whole retry sequence can sleep. Used to
    /// size lock TTLs so a lease provably outlives its retries.
    pub fn worst_case_total(&self) -> Duration {
        let mut total = 0u64;
        for attempt in 1..self.max_attempts.max(1) {
            let exp = attempt.saturating_sub(1).min(16);
            let base = self
                .base_delay_ms
                .saturating_mul(1u64 << exp)
                .min(self.max_delay_ms);
            total = total.saturating_add(base.saturating_add(self.jitter_ms));
        }
        Duration::from_millis(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            jitter_ms: 0,
        };
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(350)); // capped
        assert_eq!(p.backoff_delay(4), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 50,
        };
        for _ in 0..100 {
            let d = p.backoff_delay(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn worst_case_covers_all_sleeps() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 50,
        };
        // Two sleeps: (100 + 50) + (200 + 50)
        assert_eq!(p.worst_case_total(), Duration::from_millis(400));
    }
}
