use std::time::Duration;

use rand::Rng;

use groupq_config::GroupqSettings;

/// Retry delay policy: `base * 2^(attempt - 1)` capped at `max`, plus up to
/// `jitter` of the delay on top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(groupq_config::DEFAULT_BASE_RETRY_DELAY_MS),
            max: Duration::from_millis(groupq_config::DEFAULT_MAX_RETRY_DELAY_MS),
            jitter: groupq_config::DEFAULT_RETRY_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Retries become immediately eligible again.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn from_settings(settings: &GroupqSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.base_retry_delay_ms),
            max: Duration::from_millis(settings.max_retry_delay_ms),
            jitter: settings.retry_jitter,
        }
    }

    /// Deterministic part of the delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: i64) -> Duration {
        let attempt = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
        let exponent = attempt.saturating_sub(1).min(30);
        self.base.saturating_mul(2u32.pow(exponent)).min(self.max)
    }

    pub fn delay_for_attempt(&self, attempt: i64) -> Duration {
        let delay = self.base_delay(attempt);
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.clamp(0.0, 0.99);
        let extra = rand::rng().random_range(0.0..=delay.as_secs_f64() * jitter);
        delay + Duration::from_secs_f64(extra)
    }
}

/// Spreads `base` uniformly over `base * (1 ± jitter_factor)`.
pub(crate) fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_secs = base.as_secs_f64();
    let jitter = jitter_factor.clamp(0.0, 0.99);
    let min_delay = (base_secs * (1.0 - jitter)).max(0.0);
    let max_delay = (base_secs * (1.0 + jitter)).max(min_delay);
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(min_delay..=max_delay))
}

/// Idle poll delay after `idle_streak` consecutive empty polls, doubling from
/// `poll_interval` up to `max_interval`.
pub(crate) fn idle_poll_delay(
    poll_interval: Duration,
    max_interval: Duration,
    idle_streak: u32,
) -> Duration {
    let exponent = idle_streak.saturating_sub(1).min(16);
    poll_interval
        .saturating_mul(2u32.pow(exponent))
        .min(max_interval.max(poll_interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_millis(3_000),
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(0), Duration::from_millis(500));
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(3_000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(3_000));
    }

    #[test]
    fn base_delay_saturates_for_huge_attempt_counts() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_millis(3_000),
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay((1 << 32) + 1), Duration::from_millis(3_000));
        assert_eq!(policy.base_delay(i64::MAX), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_only_adds_up_to_the_factor() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1_000),
            max: Duration::from_secs(60),
            jitter: 0.25,
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[test]
    fn none_policy_never_delays() {
        assert!(BackoffPolicy::none().delay_for_attempt(5).is_zero());
    }

    #[test]
    fn jittered_delay_handles_zero_base() {
        assert!(jittered_delay(Duration::ZERO, 0.5).is_zero());
        let delay = jittered_delay(Duration::from_millis(100), 0.5);
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn idle_poll_delay_grows_to_max() {
        let poll = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        assert_eq!(idle_poll_delay(poll, max, 1), poll);
        assert_eq!(idle_poll_delay(poll, max, 2), Duration::from_millis(200));
        assert_eq!(idle_poll_delay(poll, max, 4), Duration::from_millis(800));
        assert_eq!(idle_poll_delay(poll, max, 5), max);
        assert_eq!(idle_poll_delay(poll, max, u32::MAX), max);
    }
}
