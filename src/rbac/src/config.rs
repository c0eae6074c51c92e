//! Runtime configuration

use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::RetryConfig;
use crate::monitor::HealthThresholds;
use crate::store::DEFAULT_BATCH_SIZE;

/// Coordinator settings
#[derive(Debug, Clone, PartialEq)]
pub struct RbacConfig {
    /// Rows per batch insert statement
    pub batch_size: usize,

    pub retry: RetryConfig,

    pub health: HealthThresholds,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
            health: HealthThresholds::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RbacConfig {
    /// Read settings from `RBAC_*` environment variables
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = env_or("RBAC_BATCH_SIZE", defaults.batch_size).max(1);

        let retry = RetryConfig {
            max_attempts: env_or("RBAC_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts).max(1),
            base_delay: Duration::from_millis(env_or(
                "RBAC_RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )),
            jitter: env_or("RBAC_RETRY_JITTER", defaults.retry.jitter).clamp(0.0, 1.0),
        };

        let health = HealthThresholds {
            min_samples: env_or("RBAC_HEALTH_MIN_SAMPLES", defaults.health.min_samples),
            max_failure_ratio: env_or(
                "RBAC_HEALTH_MAX_FAILURE_RATIO",
                defaults.health.max_failure_ratio,
            ),
            max_avg_duration: Duration::from_millis(env_or(
                "RBAC_HEALTH_MAX_AVG_MS",
                defaults.health.max_avg_duration.as_millis() as u64,
            )),
        };

        Self {
            batch_size,
            retry,
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RbacConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.health.min_samples, 10);
        assert_eq!(config.health.max_avg_duration, Duration::from_secs(1));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("RBAC_BATCH_SIZE", "25");
        std::env::set_var("RBAC_RETRY_MAX_ATTEMPTS", "5");
        std::env::set_var("RBAC_RETRY_BASE_DELAY_MS", "not-a-number");
        std::env::set_var("RBAC_HEALTH_MAX_FAILURE_RATIO", "0.2");

        let config = RbacConfig::from_env();

        std::env::remove_var("RBAC_BATCH_SIZE");
        std::env::remove_var("RBAC_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("RBAC_RETRY_BASE_DELAY_MS");
        std::env::remove_var("RBAC_HEALTH_MAX_FAILURE_RATIO");

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.health.max_failure_ratio, 0.2);
    }
}
