//! Orchestrator error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while processing a job.
///
/// These surface at the dispatcher's worker boundary, where they are
/// logged and swallowed; business outcomes (failed provisioning, lost
/// capacity) are recorded on the job row itself as `JobErrorCode`s, not
/// raised as errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("job {0} has no provisioning data")]
    MissingProvisioningData(Uuid),

    #[error("state store error: {0}")]
    State(#[from] stratus_state::StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProcessResult<T> = Result<T, ProcessError>;
