use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
use crate::{ErrorKind, Result};

/// Default number of attempts in flight across all jobs
pub const DEFAULT_MAX_WORKERS: usize = 75;

/// Default number of retries of a failed attempt, each through another proxy
pub const DEFAULT_ATTEMPT_RETRY_LIMIT: u32 = 3;

/// Default number of failed proxies a job remembers and avoids
const DEFAULT_MAX_EXCLUSIONS: usize = 32;

/// Default timeout of one simulated request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default wall-clock budget of a job without its own deadline
const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);

/// Default capacity of the event channel
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Concurrency, retry and timing settings of the [`crate::Dispatcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on attempts in flight, shared by all jobs
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How often a failed attempt is retried through a different proxy
    #[serde(default = "default_attempt_retry_limit")]
    pub attempt_retry_limit: u32,

    /// Number of failed proxies a job avoids for its remaining attempts.
    /// The oldest exclusion is forgotten first.
    #[serde(default = "default_max_exclusions")]
    pub max_exclusions: usize,

    /// Lower bound of the randomized pre-attempt delay in milliseconds,
    /// used when a job is submitted without a duration hint
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound of the randomized pre-attempt delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout of a single request through a proxy
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Deadline of jobs that do not set their own
    #[serde(default = "default_job_deadline", with = "humantime_serde")]
    pub default_deadline: Duration,

    /// Capacity of the event channel handed out by the relay
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            attempt_retry_limit: default_attempt_retry_limit(),
            max_exclusions: default_max_exclusions(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout: default_request_timeout(),
            default_deadline: default_job_deadline(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DispatcherConfig {
    /// Lower bound of the pre-attempt delay
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Upper bound of the pre-attempt delay
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Check the settings for consistency
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] if there are no workers, the delay
    /// bounds are reversed, or a timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ErrorKind::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ErrorKind::InvalidConfig(format!(
                "min_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.request_timeout.is_zero() || self.default_deadline.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "request_timeout and default_deadline must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

const fn default_attempt_retry_limit() -> u32 {
    DEFAULT_ATTEMPT_RETRY_LIMIT
}

const fn default_max_exclusions() -> usize {
    DEFAULT_MAX_EXCLUSIONS
}

#[allow(clippy::cast_possible_truncation)]
const fn default_min_delay_ms() -> u64 {
    DEFAULT_MIN_DELAY.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

const fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

const fn default_job_deadline() -> Duration {
    DEFAULT_JOB_DEADLINE
}

const fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
