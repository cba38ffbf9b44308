use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Exponential backoff settings for failed reconciles and registry writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(Error::Config(
                "Backoff initial delay must be greater than 0".to_string(),
            ));
        }

        if self.multiplier < 1.0 {
            return Err(Error::Config(
                "Backoff multiplier must be at least 1".to_string(),
            ));
        }

        if self.max < self.initial {
            return Err(Error::Config(
                "Backoff max delay must be greater than or equal to initial delay".to_string(),
            ));
        }

        Ok(())
    }
}

/// Retry state; unlike a bounded retry loop it never gives up, the caller
/// keeps retrying until the registry converges
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.calculate_delay(self.current_attempt);
        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial, Duration::from_millis(500));
        assert_eq!(config.max, Duration::from_secs(60));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn test_calculate_delay() {
        let config = BackoffConfig::default()
            .with_initial(Duration::from_millis(100))
            .with_max(Duration::from_secs(1));

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(config.calculate_delay(4), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_validate() {
        assert!(BackoffConfig::default().validate().is_ok());
        assert!(BackoffConfig::default()
            .with_multiplier(0.5)
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_max(Duration::from_millis(10))
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_initial(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(second > first);
        assert_eq!(backoff.current_attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), first);
    }
}
