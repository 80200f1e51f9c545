//! Scheduling errors.

use pkgrelay_core::AbortReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("cycle detected in dependencies: {0}")]
    CycleDetected(String),

    #[error("publish job does not depend on: {}", .0.join(", "))]
    IncompleteFanIn(Vec<String>),

    #[error("no build jobs")]
    NoJobs,
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Why a finished run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("builds failed: {}", .0.join(", "))]
    BuildsFailed(Vec<String>),

    #[error("fan-in barrier timed out")]
    BarrierTimeout,

    #[error("run timed out")]
    RunTimeout,

    #[error("run aborted: {0}")]
    Aborted(AbortReason),

    #[error("publish failed: {0}")]
    PublishFailed(String),
}
