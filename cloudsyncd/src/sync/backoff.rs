use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            // Keep at least half the exponential step so retries still spread out.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// Bounded retries for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::new(base, max, true),
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// budget is spent. A server-requested delay wins when it is longer.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let computed = self.backoff.delay(attempt.saturating_sub(1));
        Some(match retry_after {
            Some(requested) if requested > computed => requested,
            _ => computed,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jitter_stays_within_half_and_full_step() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn retry_budget_runs_out() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 2);
        assert!(policy.next_delay(1, None).is_some());
        assert!(policy.next_delay(2, None).is_some());
        assert!(policy.next_delay(3, None).is_none());
    }

    #[test]
    fn retry_after_extends_the_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 3);
        let delay = policy.next_delay(1, Some(Duration::from_secs(30))).unwrap();
        assert_eq!(delay, Duration::from_secs(30));
    }
}
