use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::proxy::ProxyKey;
use crate::types::ActorId;

/// Possible errors when interacting with `viewrelay_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The actor used up at least one of its rate limit windows
    #[error("Rate limit exceeded for actor `{actor}`, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// The actor whose request was denied
        actor: ActorId,
        /// Time until the soonest window resets
        retry_after: Duration,
    },

    /// The pool had no leasable proxy left after filtering
    #[error("No proxy available")]
    NoProxyAvailable,

    /// A connectivity probe through a candidate proxy did not finish in time
    #[error("Validation of proxy `{0}` timed out after {1:?}")]
    ValidationTimeout(ProxyKey, Duration),

    /// A single view attempt could not be carried out through a proxy
    #[error("Attempt through proxy `{proxy}` failed: {reason}")]
    AttemptFailure {
        /// The proxy the attempt was routed through
        proxy: ProxyKey,
        /// What went wrong
        reason: String,
    },

    /// A simulated request through a proxy exceeded its timeout
    #[error("Request through proxy timed out after {0:?}")]
    AttemptTimeout(Duration),

    /// The target answered through the proxy, but not with a success code
    #[error("Rejected status code: {0}")]
    RejectedStatusCode(StatusCode),

    /// The job ran past its deadline
    #[error("Job deadline exceeded")]
    JobDeadlineExceeded,

    /// The job was refused at the submission boundary
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A proxy list entry could not be parsed
    #[error("Cannot parse `{0}` as a proxy address: {1}")]
    InvalidProxy(String, String),

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse string `{1}` as website url: {0}")]
    ParseUrl(#[source] url::ParseError, String),

    /// Network error while handling a request
    #[error("Network error: {0}")]
    NetworkRequest(#[source] reqwest::Error),

    /// The request client could not be created
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// Cannot read the body of the received response
    #[error("Error reading response body: {0}")]
    ReadResponseBody(#[source] reqwest::Error),

    /// The dispatcher no longer accepts jobs
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// The task driving a job panicked or was cancelled by the runtime
    #[error("Job task failed: {0}")]
    JobPanicked(#[source] tokio::task::JoinError),

    /// Any form of I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header value could not be built from the configured string
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// A configuration value is out of its allowed range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ErrorKind {
    /// Return the underlying [`reqwest::Error`], if any
    #[must_use]
    pub const fn reqwest_error(&self) -> Option<&reqwest::Error> {
        match self {
            Self::NetworkRequest(e) | Self::BuildRequestClient(e) | Self::ReadResponseBody(e) => {
                Some(e)
            }
            _ => None,
        }
    }

    /// Whether this error describes a timeout rather than a hard failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::AttemptTimeout(_) | Self::ValidationTimeout(..) => true,
            _ => self.reqwest_error().is_some_and(reqwest::Error::is_timeout),
        }
    }
}

impl From<reqwest::Error> for ErrorKind {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkRequest(e)
    }
}
