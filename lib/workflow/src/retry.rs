//! Retry configuration and backoff strategies for saved steps.

use crate::error::RetryError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay grows linearly from the initial to the maximum backoff.
    #[default]
    Linear,
    /// Delay doubles each attempt, capped at the maximum backoff.
    Exponential,
    /// Every attempt waits the initial backoff.
    Constant,
}

/// Retry policy of one saved step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed before the step is recorded as failed.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl RetryConfig {
    /// Retries up to `max_retries` attempts with default backoff bounds.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            strategy: BackoffStrategy::default(),
        }
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Checks the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if no retries are allowed or the bounds are inverted.
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.max_retries == 0 {
            return Err(RetryError::NoRetries);
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(RetryError::InvertedBounds {
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }
        Ok(())
    }
}

/// Computes the delay before the next attempt of a failed step.
pub trait BackoffPolicy: Send + Sync + Debug {
    /// Returns the delay given how many attempts remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn delay(&self, config: &RetryConfig, retries_left: u32) -> Result<Duration, RetryError>;
}

/// The built-in policy, driven by [`RetryConfig::strategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyBackoff;

impl BackoffPolicy for StrategyBackoff {
    fn delay(&self, config: &RetryConfig, retries_left: u32) -> Result<Duration, RetryError> {
        strategy_retry(config, retries_left)
            .map(|ms| Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)))
    }
}

/// Delay in milliseconds before the next attempt.
///
/// `retries_left` counts down from `max_retries`; the first retry sees
/// `max_retries - 1` remaining.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn strategy_retry(config: &RetryConfig, retries_left: u32) -> Result<u64, RetryError> {
    config.validate()?;
    let attempt = u64::from(config.max_retries.saturating_sub(retries_left).max(1));
    let initial = config.initial_backoff_ms;
    let max = config.max_backoff_ms;

    let delay = match config.strategy {
        BackoffStrategy::Constant => initial,
        BackoffStrategy::Linear => {
            let steps = u64::from(config.max_retries);
            initial + (max - initial) * (attempt - 1) / steps
        }
        BackoffStrategy::Exponential => {
            let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(32);
            initial.saturating_mul(1u64 << shift)
        }
    };
    Ok(delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_changes() {
        let config = RetryConfig::new(5)
            .with_backoff(200, 10_000)
            .with_strategy(BackoffStrategy::Constant);
        assert_eq!(strategy_retry(&config, 4).unwrap(), 200);
        assert_eq!(strategy_retry(&config, 1).unwrap(), 200);
    }

    #[test]
    fn linear_grows_towards_max() {
        let config = RetryConfig::new(4).with_backoff(1_000, 5_000);
        let first = strategy_retry(&config, 3).unwrap();
        let second = strategy_retry(&config, 2).unwrap();
        let third = strategy_retry(&config, 1).unwrap();
        assert_eq!(first, 1_000);
        assert!(second > first);
        assert!(third > second);
        assert!(third <= 5_000);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let config = RetryConfig::new(10)
            .with_backoff(100, 1_000)
            .with_strategy(BackoffStrategy::Exponential);
        assert_eq!(strategy_retry(&config, 9).unwrap(), 100);
        assert_eq!(strategy_retry(&config, 8).unwrap(), 200);
        assert_eq!(strategy_retry(&config, 7).unwrap(), 400);
        assert_eq!(strategy_retry(&config, 1).unwrap(), 1_000);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert_eq!(
            strategy_retry(&RetryConfig::new(0), 0),
            Err(RetryError::NoRetries)
        );
        let inverted = RetryConfig::new(3).with_backoff(500, 100);
        assert!(matches!(
            strategy_retry(&inverted, 2),
            Err(RetryError::InvertedBounds { .. })
        ));
    }

    #[test]
    fn policy_returns_chrono_duration() {
        let config = RetryConfig::new(3).with_backoff(250, 250);
        let delay = StrategyBackoff.delay(&config, 2).unwrap();
        assert_eq!(delay, Duration::milliseconds(250));
    }
}
