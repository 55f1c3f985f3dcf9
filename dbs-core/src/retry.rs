//! Retry schedule for requests that expect a reply: exponential backoff with
//! a fixed attempt budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wait after the first send.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of sends before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Wait after the first send.
    pub initial_interval: Duration,
    /// Factor applied to the wait after every unanswered send.
    pub multiplier: u32,
    /// Total sends, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: 2,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_interval,
            max_attempts,
            ..Self::default()
        }
    }

    /// Wait after send number `attempt` (0-indexed), or `None` once the
    /// budget is spent.
    pub fn interval(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(30));
        Some(self.initial_interval.saturating_mul(factor))
    }

    /// Every wait of the schedule, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).filter_map(|a| self.interval(a)).collect()
    }

    /// Time from the first send until the request is declared failed.
    pub fn total(&self) -> Duration {
        self.schedule()
            .into_iter()
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_schedule() {
        let p = RetryPolicy::new(Duration::from_millis(100), 3);
        assert_eq!(
            p.schedule(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(p.total(), Duration::from_millis(700));
        assert_eq!(p.interval(3), None);
    }

    #[test]
    fn default_is_five_attempts_from_one_second() {
        let p = RetryPolicy::default();
        assert_eq!(p.schedule().len(), 5);
        assert_eq!(p.interval(4), Some(Duration::from_secs(16)));
    }

    #[test]
    fn custom_multiplier_and_zero_budget() {
        let p = RetryPolicy {
            multiplier: 3,
            ..RetryPolicy::new(Duration::from_secs(1), 3)
        };
        assert_eq!(p.interval(2), Some(Duration::from_secs(9)));
        assert!(RetryPolicy::new(Duration::from_secs(1), 0).schedule().is_empty());
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let p = RetryPolicy::new(Duration::from_secs(1), u32::MAX);
        assert!(p.interval(1000).is_some());
    }
}
