use std::time::Duration;

use crate::config::FeedConfig;

/// Capped exponential schedule: `min(initial * 2^attempt, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    initial: Duration,
    max: Duration,
}

impl RetrySchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.retry_initial, config.retry_max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
