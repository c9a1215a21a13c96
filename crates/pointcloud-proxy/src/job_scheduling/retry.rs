//! Bounded retry with capped exponential backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::JobsConfig;
use crate::errors::PipelineError;

/// Fraction of the base delay added or removed at random.
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            jitter: true,
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_initial_delay,
            config.retry_max_delay,
            config.backoff_multiplier,
        )
    }

    /// Disable jitter, for deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, error: &PipelineError) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts
    }

    /// Delay before the attempt following `attempts_made`, without jitter.
    pub fn base_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before the attempt following `attempts_made`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = self.base_delay(attempts_made);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.max_delay)
    }
}
