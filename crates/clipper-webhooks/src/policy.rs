//! Retry decision and backoff schedule.
//!
//! `FailureTransition` decides what a failed attempt does to a delivery;
//! `BackoffPolicy` decides how long it waits before the next one. Both are
//! pure so every store backend applies the same rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use clipper_db::DeliveryStatus;

/// Default base delay before the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Default ceiling on a single retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Default jitter as a fraction of the capped delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// State a delivery moves to after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTransition {
    pub attempt_count: i32,
    pub status: DeliveryStatus,
}

impl FailureTransition {
    /// Evaluate against the persisted attempt count.
    ///
    /// The attempt count is incremented and capped at `max_attempts`; reaching
    /// the cap marks the delivery failed.
    #[must_use]
    pub fn evaluate(attempt_count: i32, max_attempts: i32) -> Self {
        let next = attempt_count.saturating_add(1).min(max_attempts.max(1));
        let status = if next >= max_attempts {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Pending
        };
        Self {
            attempt_count: next,
            status,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

/// Capped exponential backoff with symmetric jitter.
///
/// `delay(n) = min(base * 2^(n-1), max) ± jitter`, `n` being the attempt
/// count after the failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Delay before the next attempt, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt_count: i32) -> Duration {
        let exponent = u32::try_from(attempt_count.saturating_sub(1).max(0)).unwrap_or(0);
        let factor = 2u32.checked_pow(exponent.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before the next attempt, jitter applied.
    #[must_use]
    pub fn delay(&self, attempt_count: i32) -> Duration {
        let delay = self.base_delay(attempt_count);
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let spread = (millis as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let offset = rng.gen_range(0..=spread);
        let jittered = if rng.gen_bool(0.5) {
            millis.saturating_add(offset)
        } else {
            millis.saturating_sub(offset)
        };
        Duration::from_millis(jittered)
    }

    /// Earliest time the next attempt may run.
    #[must_use]
    pub fn next_attempt_at(&self, attempt_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64));
        now + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_failures_stay_pending() {
        let mut count = 0;
        for _ in 0..4 {
            let t = FailureTransition::evaluate(count, 5);
            assert_eq!(t.status, DeliveryStatus::Pending);
            count = t.attempt_count;
        }
        assert_eq!(count, 4);

        let fifth = FailureTransition::evaluate(count, 5);
        assert_eq!(fifth.status, DeliveryStatus::Failed);
        assert_eq!(fifth.attempt_count, 5);
        assert!(fifth.is_exhausted());
    }

    #[test]
    fn test_single_attempt_budget() {
        let t = FailureTransition::evaluate(0, 1);
        assert_eq!(t.attempt_count, 1);
        assert!(t.is_exhausted());
    }

    #[test]
    fn test_attempt_count_never_exceeds_max() {
        let t = FailureTransition::evaluate(5, 5);
        assert_eq!(t.attempt_count, 5);
        assert!(t.is_exhausted());
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(4), Duration::from_secs(240));
    }

    #[test]
    fn test_max_delay_capped() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(8), Duration::from_secs(3600));
        assert_eq!(policy.delay(40), Duration::from_secs(3600));
        assert_eq!(policy.delay(i32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_within_twenty_percent() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let d = policy.delay(2).as_millis();
            assert!((48_000..=72_000).contains(&d), "delay {d}ms out of range");
        }
    }

    #[test]
    fn test_next_attempt_at_is_in_future() {
        let now = Utc::now();
        let next = BackoffPolicy::default().next_attempt_at(1, now);
        let secs = (next - now).num_seconds();
        assert!((24..=36).contains(&secs));
    }
}
