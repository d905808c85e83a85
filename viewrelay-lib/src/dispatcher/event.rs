use std::time::Duration;

use serde::Serialize;

use crate::proxy::ProxyKey;
use crate::types::{ActorId, FailureKind, JobId, JobResult, JobState};

/// Something observers of the dispatcher may want to know about.
///
/// Events are delivered on a bounded channel. Attempt telemetry and
/// non-terminal state changes are dropped while the channel is full; terminal
/// state changes and results wait for room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A job moved to a new state
    StateChanged {
        /// The job
        job_id: JobId,
        /// Who submitted it
        actor: ActorId,
        /// Its new state
        state: JobState,
    },
    /// One try of one attempt finished
    Attempt(AttemptTelemetry),
    /// A job reached a terminal state
    Finished(JobResult),
}

impl DispatchEvent {
    /// The job this event belongs to
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::StateChanged { job_id, .. } => *job_id,
            Self::Attempt(telemetry) => telemetry.job_id,
            Self::Finished(result) => result.job_id,
        }
    }
}

/// Outcome of a single try through a single proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptTelemetry {
    /// The job the attempt belongs to
    pub job_id: JobId,
    /// Index of the attempt within the job
    pub attempt: usize,
    /// Zero for the first try, counting up with every retry
    pub try_number: u32,
    /// Proxy the try was routed through
    pub proxy: ProxyKey,
    /// `None` on success
    pub failure: Option<FailureKind>,
    /// Time spent on the request, excluding the pre-attempt delay
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl AttemptTelemetry {
    /// Whether the try succeeded
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}
