//! Submission gateway interface to the external resource manager.
//!
//! The gateway abstracts the three operations the engine needs:
//! - Submitting a job and receiving a handle
//! - Querying a job's status as a closed four-state answer
//! - Removing a job (best-effort)
//!
//! plus a reconciliation lookup used after a crash lost a handle.
//!
//! Implementations:
//! - [`CondorGateway`]: HTCondor command-line tools
//! - [`MockGateway`]: scriptable in-memory manager for tests and dry runs

mod condor;
mod mock;

pub use condor::{CondorConfig, CondorGateway};
pub use mock::MockGateway;

use async_trait::async_trait;
use sitemon_model::{JobHandle, JobSpec};
use thiserror::Error;

/// Errors from gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The manager's client could not be started or reached.
    #[error("resource manager unreachable: {0}")]
    Unreachable(String),

    /// The manager refused the request.
    #[error("rejected by resource manager: {0}")]
    Rejected(String),

    /// The manager answered with something we could not interpret.
    #[error("unexpected resource manager response: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of a job as seen by the resource manager.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Waiting to run.
    Queued,
    /// Executing.
    Running,
    /// Finished, successfully or not.
    Completed(Completion),
    /// Unknown to the manager.
    NotFound,
}

/// How a finished job ended, with optional accounting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    /// True if the job terminated normally with exit code zero.
    pub succeeded: bool,
    /// Why the job did not succeed.
    pub detail: Option<String>,
    pub wall_clock_secs: Option<f64>,
    pub cpu_efficiency: Option<f64>,
}

impl Completion {
    pub fn succeeded() -> Self {
        Self {
            succeeded: true,
            ..Self::default()
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Narrow interface to the resource manager.
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    /// Submit one instance of a job. `tag` is attached to the external job so
    /// [`SubmissionGateway::lookup`] can find it again.
    async fn submit(&self, spec: &JobSpec, tag: &str) -> Result<JobHandle, GatewayError>;

    /// Query the current status of a job.
    async fn query(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError>;

    /// Remove a job. Best-effort; callers do not wait on the outcome.
    async fn remove(&self, handle: &JobHandle) -> Result<(), GatewayError>;

    /// Find a job previously submitted with `tag`.
    async fn lookup(&self, tag: &str) -> Result<Option<JobHandle>, GatewayError>;
}
