use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use typed_builder::TypedBuilder;
use url::Url;

use crate::proxy::ProxyKey;
use crate::{ErrorKind, Result};

/// Default number of views requested by a job
pub const DEFAULT_VIEW_COUNT: usize = 100;
/// Upper bound for the number of views in a single job
pub const MAX_VIEW_COUNT: usize = 1000;
/// Default lower bound of the randomized delay before each attempt
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(24);
/// Default upper bound of the randomized delay before each attempt
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(36);
/// Longest delay a job may wait before a single attempt
pub const MAX_ATTEMPT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Identifies who submitted a job. Rate limits are tracked per actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Get the actor id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        ActorId(id)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        ActorId(id.to_string())
    }
}

impl From<u64> for ActorId {
    fn from(id: u64) -> Self {
        ActorId(id.to_string())
    }
}

/// Process-unique job identifier handed out by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(crate) const fn new(id: u64) -> Self {
        JobId(id)
    }

    /// Numeric value of the id
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request to simulate `requested_count` views of `target`.
///
/// Jobs are immutable once built. Use [`ViewJob::builder`] to create one:
///
/// ```
/// use std::time::Duration;
/// use viewrelay_lib::ViewJob;
/// use url::Url;
///
/// let job = ViewJob::builder()
///     .actor("alice")
///     .target(Url::parse("https://example.com/watch?v=1").unwrap())
///     .requested_count(10)
///     .min_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_millis(300))
///     .build();
///
/// assert_eq!(job.requested_count(), 10);
/// assert!(job.validate().is_ok());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ViewJob {
    #[builder(setter(into))]
    actor: ActorId,
    target: Url,
    #[builder(default = DEFAULT_VIEW_COUNT)]
    requested_count: usize,
    #[builder(default = DEFAULT_MIN_DELAY)]
    min_delay: Duration,
    #[builder(default = DEFAULT_MAX_DELAY)]
    max_delay: Duration,
    /// Time budget for the whole job, counted from submission.
    /// `None` falls back to the dispatcher's default deadline.
    #[builder(default, setter(strip_option))]
    deadline: Option<Duration>,
}

impl ViewJob {
    /// Build a job whose per-attempt delay is spread 20% around `hint`.
    ///
    /// A hint too large to spread leaves the job with an out-of-range delay
    /// that [`ViewJob::validate`] rejects.
    #[must_use]
    pub fn from_duration_hint(
        actor: impl Into<ActorId>,
        target: Url,
        count: usize,
        hint: Duration,
    ) -> Self {
        ViewJob {
            actor: actor.into(),
            target,
            requested_count: count,
            min_delay: hint.mul_f64(0.8),
            max_delay: Duration::try_from_secs_f64(1.2 * hint.as_secs_f64()).unwrap_or(Duration::MAX),
            deadline: None,
        }
    }

    /// Give the job its own deadline, counted from submission
    #[must_use]
    pub fn with_deadline(self, deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Who submitted the job
    #[must_use]
    pub const fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// The resource to request through the proxies
    #[must_use]
    pub const fn target(&self) -> &Url {
        &self.target
    }

    /// How many attempts the job consists of
    #[must_use]
    pub const fn requested_count(&self) -> usize {
        self.requested_count
    }

    /// Lower bound of the delay before each attempt
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Upper bound of the delay before each attempt
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The job's own deadline, if it has one
    #[must_use]
    pub const fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Check the job's fields before it is admitted
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidJob`] if the target is not an HTTP(S) URL,
    /// the count is outside `1..=MAX_VIEW_COUNT`, the delay bounds are
    /// swapped or above [`MAX_ATTEMPT_DELAY`], or the deadline is zero.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.target.scheme(), "http" | "https") {
            return Err(ErrorKind::InvalidJob(format!(
                "unsupported target scheme `{}`",
                self.target.scheme()
            )));
        }
        if !(1..=MAX_VIEW_COUNT).contains(&self.requested_count) {
            return Err(ErrorKind::InvalidJob(format!(
                "requested count {} is outside 1..={MAX_VIEW_COUNT}",
                self.requested_count
            )));
        }
        if self.min_delay > self.max_delay {
            return Err(ErrorKind::InvalidJob(format!(
                "minimum delay {:?} exceeds maximum delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        if self.max_delay > MAX_ATTEMPT_DELAY {
            return Err(ErrorKind::InvalidJob(format!(
                "maximum delay {:?} exceeds {MAX_ATTEMPT_DELAY:?}",
                self.max_delay
            )));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ErrorKind::InvalidJob("deadline must be positive".to_string()));
        }
        Ok(())
    }
}

/// Why a job stopped before all of its attempts completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    /// The job's deadline elapsed
    DeadlineExceeded,
    /// A lease failed although nothing was excluded
    PoolExhausted,
    /// The dispatcher was shut down
    Shutdown,
}

/// Lifecycle of a job inside the dispatcher
///
/// `Queued → Admitted → Running → {Completed, PartiallyFailed, Aborted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, not yet checked against the rate limiter
    Queued,
    /// Accepted by the rate limiter
    Admitted,
    /// Attempts are being executed
    Running,
    /// Every attempt succeeded
    Completed,
    /// All attempts finished and at least one failed
    PartiallyFailed,
    /// The job stopped early
    Aborted(AbortReason),
}

impl JobState {
    /// Whether the job will not change state anymore
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Aborted(_)
        )
    }

    /// The error that explains an aborted job, if this is one
    #[must_use]
    pub fn abort_error(&self) -> Option<ErrorKind> {
        match self {
            Self::Aborted(AbortReason::DeadlineExceeded) => Some(ErrorKind::JobDeadlineExceeded),
            Self::Aborted(AbortReason::PoolExhausted) => Some(ErrorKind::NoProxyAvailable),
            Self::Aborted(AbortReason::Shutdown) => Some(ErrorKind::ShuttingDown),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Admitted => write!(f, "admitted"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Aborted(reason) => write!(f, "aborted ({reason})"),
        }
    }
}

/// Classification of a single failed try
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureKind {
    /// The target answered with a non-success status code
    Status(u16),
    /// The request or probe timed out
    Timeout,
    /// Any other network or proxy error
    Network(String),
    /// The pool had nothing left to lease
    NoProxyAvailable,
}

impl From<&ErrorKind> for FailureKind {
    fn from(e: &ErrorKind) -> Self {
        match e {
            ErrorKind::RejectedStatusCode(status) => FailureKind::Status(status.as_u16()),
            ErrorKind::NoProxyAvailable => FailureKind::NoProxyAvailable,
            e if e.is_timeout() => FailureKind::Timeout,
            e => FailureKind::Network(e.to_string()),
        }
    }
}

/// One failed try of one attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Index of the attempt inside the job
    pub attempt: usize,
    /// Zero-based try number within the attempt's retry loop
    pub try_number: u32,
    /// The proxy the try went through, if one was leased
    pub proxy: Option<ProxyKey>,
    /// What went wrong
    pub kind: FailureKind,
    /// When the failure was observed, relative to the job start
    #[serde(with = "humantime_serde")]
    pub at: Duration,
}

/// Aggregated outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Which job this result belongs to
    pub job_id: JobId,
    /// Who submitted the job
    pub actor: ActorId,
    /// Terminal state of the job
    pub state: JobState,
    /// Number of attempts the job asked for
    pub requested_count: usize,
    /// Attempts that ended in a successful view
    pub succeeded_count: usize,
    /// Attempts that used up their retries
    pub failed_count: usize,
    /// Attempts that never finished because the job was aborted
    pub cancelled_count: usize,
    /// Distinct proxies leased by the job, in order of first use
    pub proxies_used: Vec<ProxyKey>,
    /// Failures in the order they were observed
    pub errors: Vec<FailureRecord>,
    /// Wall time from start of execution to the terminal state
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl JobResult {
    /// Whether every requested attempt succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.state, JobState::Completed)
    }
}
