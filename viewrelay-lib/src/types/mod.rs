#![allow(unreachable_pub)]

mod error;
mod job;

pub use error::ErrorKind;
pub use job::{
    AbortReason, ActorId, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY, DEFAULT_VIEW_COUNT, FailureKind,
    FailureRecord, JobId, JobResult, JobState, MAX_ATTEMPT_DELAY, MAX_VIEW_COUNT, ViewJob,
};

/// The viewrelay `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
