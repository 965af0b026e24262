//! Exponential backoff between automatic retries

use std::time::Duration;

use crate::config::WorkerConfig;

/// Backoff policy applied by the worker pool.
///
/// The n-th retry (0-indexed `retry_count`) waits `base_delay * multiplier^n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max_delay: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// No waiting at all (tests, manual drains)
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}
