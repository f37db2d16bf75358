//! Bounded exponential backoff with jitter.
//!
//! One [`RetryPolicy`] is shared by the LLM pipeline and the tool executor.
//! The schedule is `min(base × 2^attempt, cap) × (1 ± jitter)`.

use std::time::Duration;

use rand::Rng;

use crate::chatbridge::config::BridgeConfig;

/// Retry schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Relative jitter applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Build the policy from the bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            cap: config.retry_cap,
            jitter: 0.2,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            cap: Duration::from_secs(4),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        // capped
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: 0.25,
        };
        for _ in 0..50 {
            let d = policy.delay_for(0).as_secs_f64();
            assert!((1.5..=2.5).contains(&d), "delay {} out of band", d);
        }
    }
}
