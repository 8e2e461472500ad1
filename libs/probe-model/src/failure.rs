//! Reasons a probe instance produced a failing result for infrastructure
//! rather than test reasons.

use thiserror::Error;

use crate::error::ArtifactError;

/// Why an instance failed independently of its own test verdicts.
///
/// The `Display` output is recorded verbatim as
/// [`crate::ProbeResult::failure_reason`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The resource manager rejected or could not be reached during submit.
    #[error("submission failed: {0}")]
    Submission(String),

    /// A status query failed or did not answer in time.
    #[error("status query failed: {0}")]
    Query(String),

    /// The instance did not complete before its deadline.
    #[error("timeout")]
    Timeout,

    /// The resource manager no longer knows the job.
    #[error("job not found in resource manager")]
    NotFound,

    /// The process stopped between persisting the instance and learning its
    /// handle, and the job could not be found again.
    #[error("submission interrupted before a handle was recorded")]
    Interrupted,

    /// The job finished but was removed, held or exited non-zero.
    #[error("job did not complete successfully: {0}")]
    JobUnsuccessful(String),

    /// The result artifact was missing or malformed.
    #[error("invalid result artifact: {0}")]
    Validation(#[from] ArtifactError),
}
