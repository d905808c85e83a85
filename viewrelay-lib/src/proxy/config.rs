use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ErrorKind;
use crate::proxy::Protocol;
use crate::types::Result;

/// Default smoothing factor of the success-rate moving average
const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Default weight of the success rate in a proxy's score
const DEFAULT_SUCCESS_WEIGHT: f64 = 0.7;

/// Default weight of the latency term in a proxy's score
const DEFAULT_LATENCY_WEIGHT: f64 = 0.3;

/// Latency at which the latency term contributes half its weight
const DEFAULT_LATENCY_REFERENCE: Duration = Duration::from_secs(1);

/// Consecutive failures after which a healthy proxy is degraded
const DEFAULT_DEGRADE_AFTER: u32 = 1;

/// Consecutive failures after which a proxy is considered dead
const DEFAULT_DEAD_AFTER: u32 = 3;

/// How long a dead proxy is remembered before it is evicted
const DEFAULT_DEAD_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Age after which a healthy proxy is queued for revalidation
const DEFAULT_REVALIDATE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Default number of usable proxies the replenisher aims for
pub const DEFAULT_POOL_TARGET_SIZE: usize = 150;

/// Default number of probes running at the same time
pub const DEFAULT_VALIDATION_CONCURRENCY: usize = 50;

/// Default timeout of a single connectivity probe
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(12);

/// Default time a verdict stays fresh in the validator's cache
const DEFAULT_VERDICT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default capacity of the validator's verdict cache
const DEFAULT_VERDICT_CACHE_CAPACITY: usize = 1000;

/// Default number of entries taken from a list per fetch
pub const DEFAULT_SOURCE_LIMIT: usize = 30;

/// Scoring and health thresholds of the [`crate::proxy::ProxyPool`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Weight of the newest observation in the success-rate average (0, 1]
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Weight of the success rate in the score
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,

    /// Weight of the inverse latency in the score
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Latency that scores half of `latency_weight`
    #[serde(default = "default_latency_reference", with = "humantime_serde")]
    pub latency_reference: Duration,

    /// Consecutive failures that demote `Healthy` to `Degraded`
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,

    /// Consecutive failures that demote a proxy to `Dead`
    #[serde(default = "default_dead_after")]
    pub dead_after: u32,

    /// Time a `Dead` proxy is kept (and blocks re-ingest) before eviction
    #[serde(default = "default_dead_grace_period", with = "humantime_serde")]
    pub dead_grace_period: Duration,

    /// Age after which a `Healthy` proxy is queued for revalidation
    #[serde(default = "default_revalidate_after", with = "humantime_serde")]
    pub revalidate_after: Duration,

    /// Number of usable proxies the replenisher tries to keep
    #[serde(default = "default_target_size")]
    pub target_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            success_weight: default_success_weight(),
            latency_weight: default_latency_weight(),
            latency_reference: default_latency_reference(),
            degrade_after: default_degrade_after(),
            dead_after: default_dead_after(),
            dead_grace_period: default_dead_grace_period(),
            revalidate_after: default_revalidate_after(),
            target_size: default_target_size(),
        }
    }
}

impl PoolConfig {
    /// Check that thresholds and weights are usable
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] if the smoothing factor is outside
    /// `(0, 1]`, a weight is negative, the failure thresholds are zero or out of
    /// order, or the target size is zero.
    pub fn validate(&self) -> Result<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ErrorKind::InvalidConfig(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if self.success_weight < 0.0 || self.latency_weight < 0.0 {
            return Err(ErrorKind::InvalidConfig(
                "score weights must not be negative".to_string(),
            ));
        }
        if self.degrade_after == 0 || self.dead_after < self.degrade_after {
            return Err(ErrorKind::InvalidConfig(format!(
                "failure thresholds must satisfy 1 <= degrade_after ({}) <= dead_after ({})",
                self.degrade_after, self.dead_after
            )));
        }
        if self.target_size == 0 {
            return Err(ErrorKind::InvalidConfig(
                "proxy pool target size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_ema_alpha() -> f64 {
    DEFAULT_EMA_ALPHA
}

const fn default_success_weight() -> f64 {
    DEFAULT_SUCCESS_WEIGHT
}

const fn default_latency_weight() -> f64 {
    DEFAULT_LATENCY_WEIGHT
}

const fn default_latency_reference() -> Duration {
    DEFAULT_LATENCY_REFERENCE
}

const fn default_degrade_after() -> u32 {
    DEFAULT_DEGRADE_AFTER
}

const fn default_dead_after() -> u32 {
    DEFAULT_DEAD_AFTER
}

const fn default_dead_grace_period() -> Duration {
    DEFAULT_DEAD_GRACE_PERIOD
}

const fn default_revalidate_after() -> Duration {
    DEFAULT_REVALIDATE_AFTER
}

const fn default_target_size() -> usize {
    DEFAULT_POOL_TARGET_SIZE
}

/// Settings of the [`crate::proxy::ProxyValidator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum number of probes in flight
    #[serde(default = "default_validation_concurrency")]
    pub concurrency: usize,

    /// Timeout of a single probe
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// URLs requested through the candidate, tried in order
    #[serde(default = "default_probe_urls")]
    pub probe_urls: Vec<Url>,

    /// How long a verdict is reused before the proxy is probed again
    #[serde(default = "default_verdict_ttl", with = "humantime_serde")]
    pub verdict_ttl: Duration,

    /// Maximum number of cached verdicts
    #[serde(default = "default_verdict_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_validation_concurrency(),
            timeout: default_probe_timeout(),
            probe_urls: default_probe_urls(),
            verdict_ttl: default_verdict_ttl(),
            cache_capacity: default_verdict_cache_capacity(),
        }
    }
}

const fn default_validation_concurrency() -> usize {
    DEFAULT_VALIDATION_CONCURRENCY
}

const fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

const fn default_verdict_ttl() -> Duration {
    DEFAULT_VERDICT_TTL
}

const fn default_verdict_cache_capacity() -> usize {
    DEFAULT_VERDICT_CACHE_CAPACITY
}

fn default_probe_urls() -> Vec<Url> {
    ["http://httpbin.org/ip", "http://api.ipify.org/", "http://icanhazip.com/"]
        .iter()
        .filter_map(|url| Url::parse(url).ok())
        .collect()
}

/// One remote proxy list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Where to download the list from
    pub url: Url,

    /// Protocol of entries that carry no scheme
    #[serde(default)]
    pub protocol: Protocol,

    /// Maximum number of entries taken per fetch
    #[serde(default = "default_source_limit")]
    pub limit: usize,
}

const fn default_source_limit() -> usize {
    DEFAULT_SOURCE_LIMIT
}

/// The public lists used when no sources are configured
#[must_use]
pub fn default_sources() -> Vec<SourceConfig> {
    [
        (
            "https://www.proxy-list.download/api/v1/get?type=http",
            Protocol::Http,
        ),
        (
            "https://www.proxy-list.download/api/v1/get?type=socks4",
            Protocol::Socks4,
        ),
        (
            "https://www.proxy-list.download/api/v1/get?type=socks5",
            Protocol::Socks5,
        ),
        (
            "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
            Protocol::Http,
        ),
    ]
    .into_iter()
    .filter_map(|(url, protocol)| {
        Url::parse(url).ok().map(|url| SourceConfig {
            url,
            protocol,
            limit: DEFAULT_SOURCE_LIMIT,
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.dead_after, 3);
        assert_eq!(config.degrade_after, 1);
        assert_eq!(config.dead_grace_period, Duration::from_secs(600));
        assert_eq!(config.target_size, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_from_toml() {
        let config: PoolConfig = toml::from_str(
            r#"
            dead_after = 5
            dead_grace_period = "30m"
            latency_reference = "500ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.dead_after, 5);
        assert_eq!(config.dead_grace_period, Duration::from_secs(30 * 60));
        assert_eq!(config.latency_reference, Duration::from_millis(500));
        // Unset keys fall back to their defaults
        assert_eq!(config.degrade_after, 1);
        assert_eq!(config.ema_alpha, 0.3);
    }

    #[test]
    fn test_pool_config_rejects_inverted_thresholds() {
        let config = PoolConfig {
            degrade_after: 4,
            dead_after: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(ErrorKind::InvalidConfig(_))));
    }

    #[test]
    fn test_default_validator_config() {
        let config = ValidatorConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(12));
        assert_eq!(config.probe_urls.len(), 3);
        assert_eq!(config.probe_urls[0].as_str(), "http://httpbin.org/ip");
    }

    #[test]
    fn test_default_sources() {
        let sources = default_sources();
        assert_eq!(sources.len(), 4);
        assert!(sources.iter().all(|s| s.limit == 30));
        assert_eq!(sources[2].protocol, Protocol::Socks5);
    }

    #[test]
    fn test_source_config_from_toml() {
        let source: SourceConfig = toml::from_str(
            r#"
            url = "https://lists.example.com/socks.txt"
            protocol = "socks5"
            "#,
        )
        .unwrap();
        assert_eq!(source.protocol, Protocol::Socks5);
        assert_eq!(source.limit, DEFAULT_SOURCE_LIMIT);
    }
}
