use std::time::Duration;

/// Attempt budget and exponential backoff for failed work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th execution failed (1-based):
    /// `base * 2^(attempt - 1)`, capped. The first retry waits `base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// How long finished work items are kept for inspection.
///
/// Failed items are kept longer and in larger numbers than completed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max: u32,
    pub completed_max_age: Duration,
    pub failed_max: u32,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max: 100,
            completed_max_age: Duration::from_secs(3600),
            failed_max: 500,
            failed_max_age: Duration::from_secs(24 * 3600),
        }
    }
}
