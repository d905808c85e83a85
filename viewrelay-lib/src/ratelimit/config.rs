use serde::{Deserialize, Serialize};

use crate::ratelimit::WindowKind;
use crate::{ErrorKind, Result};

/// Default number of admissions per actor per minute
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 15;

/// Default number of admissions per actor per hour
pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 150;

/// Default number of admissions per actor per day
pub const DEFAULT_RATE_LIMIT_PER_DAY: u32 = 1000;

/// Per-actor limits for each fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admissions per actor in one minute window
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    /// Maximum admissions per actor in one hour window
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,

    /// Maximum admissions per actor in one day window
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
        }
    }
}

const fn default_per_minute() -> u32 {
    DEFAULT_RATE_LIMIT_PER_MINUTE
}

const fn default_per_hour() -> u32 {
    DEFAULT_RATE_LIMIT_PER_HOUR
}

const fn default_per_day() -> u32 {
    DEFAULT_RATE_LIMIT_PER_DAY
}

impl RateLimitConfig {
    /// Create a `RateLimitConfig` from CLI options, using defaults for missing values
    #[must_use]
    pub fn from_options(
        per_minute: Option<u32>,
        per_hour: Option<u32>,
        per_day: Option<u32>,
    ) -> Self {
        Self {
            per_minute: per_minute.unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
            per_hour: per_hour.unwrap_or(DEFAULT_RATE_LIMIT_PER_HOUR),
            per_day: per_day.unwrap_or(DEFAULT_RATE_LIMIT_PER_DAY),
        }
    }

    /// The configured limit of one window
    #[must_use]
    pub const fn limit(&self, kind: WindowKind) -> u32 {
        match kind {
            WindowKind::Minute => self.per_minute,
            WindowKind::Hour => self.per_hour,
            WindowKind::Day => self.per_day,
        }
    }

    /// Check that every limit admits at least one request
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] if a limit is zero.
    pub fn validate(&self) -> Result<()> {
        for kind in WindowKind::ALL {
            if self.limit(kind) == 0 {
                return Err(ErrorKind::InvalidConfig(format!(
                    "rate limit per {kind} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}
