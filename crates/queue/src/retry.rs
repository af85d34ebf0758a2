//! Retry backoff configuration.

use std::time::Duration;

use bazaar_common::QueueConfig;

/// How the delay grows with the attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// `unit × attempts`.
    Linear,
    /// `unit × multiplier^(attempts − 1)`.
    Exponential { multiplier: f64 },
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay unit.
    pub backoff_unit: Duration,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(5),
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryConfig {
    /// Linear backoff with the given unit.
    #[must_use]
    pub fn linear(backoff_unit: Duration) -> Self {
        Self {
            backoff_unit,
            ..Self::default()
        }
    }

    /// Exponential backoff starting at `backoff_unit`.
    #[must_use]
    pub fn exponential(backoff_unit: Duration, multiplier: f64) -> Self {
        Self {
            backoff_unit,
            strategy: BackoffStrategy::Exponential { multiplier },
            ..Self::default()
        }
    }

    /// Build from the queue settings.
    #[must_use]
    pub const fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            backoff_unit: Duration::from_millis(config.backoff_delay_ms),
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before the next run, given how many attempts have been made (1-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let unit = self.backoff_unit.as_secs_f64();

        let delay_secs = match self.strategy {
            BackoffStrategy::Linear => unit * f64::from(attempts),
            BackoffStrategy::Exponential { multiplier } => {
                unit * multiplier.powi(attempts as i32 - 1)
            }
        };

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}
