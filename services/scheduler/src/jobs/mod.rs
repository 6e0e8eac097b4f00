//! Job lifecycle: the entity, its persistence, and the manager that drives it
//! through allocation and launch.
//!
//! - [`Job`] and [`JobStatus`] model the phase/step state machine
//! - [`JobStore`] persists jobs and keeps the active and unsettled indexes
//! - [`JobManager`] runs the control loop tick and the administrative actions
//! - [`SchedulerWorker`] repeats the tick under the fleet-wide lock

mod job;
mod manager;
mod queue;
mod request;
mod status;
mod store;
mod worker;

pub use job::{DataCategory, DataRequirement, Job, JobKind, PartitionConfig};
pub use manager::{JobManager, TickStats};
pub use queue::{build_priority_queues, JobQueue, PriorityQueues, QueuePolicy, QueuedJob};
pub use request::JobRequest;
pub use status::{JobExecPhase, JobExecStep, JobStatus, StatusParseError};
pub use store::JobStore;
pub use worker::SchedulerWorker;

use hydromaas_id::{IdError, JobId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::{ParadigmParseError, ResourceError};
use crate::store::{Retryable, StoreError};

/// Errors from job operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    UnrecognizedParadigm(#[from] ParadigmParseError),

    #[error("invalid job id: {0}")]
    InvalidJobId(#[from] IdError),

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Retryable for JobError {
    fn is_conflict(&self) -> bool {
        match self {
            JobError::Store(e) => e.is_conflict(),
            JobError::Resource(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Why an administrative action did or did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionReason {
    Success,
    NotFound,
    InvalidState,
    NotEligible,
    StoreFailure,
}

/// Structured outcome of an administrative action on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobActionResponse {
    pub success: bool,
    pub reason: ActionReason,
    pub message: String,
}

impl JobActionResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: ActionReason::Success,
            message: message.into(),
        }
    }

    pub fn failure(reason: ActionReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason,
            message: message.into(),
        }
    }

    pub fn not_found(job_id: JobId) -> Self {
        Self::failure(ActionReason::NotFound, format!("job {job_id} not found"))
    }

    pub fn invalid_state(job: &Job, expected: JobExecStep) -> Self {
        Self::failure(
            ActionReason::InvalidState,
            format!(
                "job {} is at {}, expected step {}",
                job.job_id(),
                job.status(),
                expected
            ),
        )
    }

    pub fn store_failure(error: &JobError) -> Self {
        Self::failure(ActionReason::StoreFailure, error.to_string())
    }
}
