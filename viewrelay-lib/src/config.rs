use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig;
use crate::proxy::{PoolConfig, SourceConfig, ValidatorConfig, default_sources};
use crate::ratelimit::RateLimitConfig;
use crate::{ErrorKind, Result};

/// Default time between two background refresh cycles
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Everything needed to set up a [`crate::ViewRelay`].
///
/// Every section and key is optional when deserializing; missing values take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Per-actor admission limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Proxy scoring and health thresholds
    #[serde(default)]
    pub pool: PoolConfig,

    /// Proxy probing
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Job execution
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Remote proxy lists
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Time between background refresh cycles
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            pool: PoolConfig::default(),
            validator: ValidatorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sources: default_sources(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

const fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

impl Config {
    /// Check every section
    ///
    /// # Errors
    ///
    /// Returns the first [`ErrorKind::InvalidConfig`] found.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        self.pool.validate()?;
        self.dispatcher.validate()?;
        if self.validator.concurrency == 0 {
            return Err(ErrorKind::InvalidConfig(
                "validation concurrency must be at least 1".to_string(),
            ));
        }
        if self.validator.timeout.is_zero() || self.refresh_interval.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "validation timeout and refresh interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sources.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_from_toml() {
        let config: Config = toml::from_str(
            r#"
            refresh_interval = "15m"

            [rate_limit]
            per_minute = 5

            [dispatcher]
            max_workers = 10

            [[sources]]
            url = "https://lists.test/socks.txt"
            protocol = "socks5"
            "#,
        )
        .unwrap();

        assert_eq!(config.refresh_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.rate_limit.per_minute, 5);
        assert_eq!(config.rate_limit.per_hour, 150);
        assert_eq!(config.dispatcher.max_workers, 10);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].limit, 30);
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let config = Config {
            validator: ValidatorConfig {
                concurrency: 0,
                ..ValidatorConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ErrorKind::InvalidConfig(_))));
    }
}
