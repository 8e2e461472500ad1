//! Result validation for completed instances.
//!
//! Reads the artifact a job left behind and folds it, together with how the
//! resource manager says the job ended, into a [`ProbeResult`]. Every
//! failure here is a failing result, never an error of the agent.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use sitemon_model::{parse_artifact, ArtifactError, JobInstance, ProbeFailure, ProbeResult, TestResult};
use tracing::debug;

use crate::gateway::Completion;

/// Read and validate the artifact at `path`.
pub async fn read_artifact(path: &Path) -> Result<Vec<TestResult>, ArtifactError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => ArtifactError::Missing {
            path: path.display().to_string(),
        },
        _ => ArtifactError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        },
    })?;
    parse_artifact(&bytes)
}

/// Build the result of a completed instance.
pub async fn evaluate(
    instance: &JobInstance,
    completion: &Completion,
    finished_at: DateTime<Utc>,
) -> ProbeResult {
    let job_failure = (!completion.succeeded).then(|| {
        ProbeFailure::JobUnsuccessful(
            completion
                .detail
                .clone()
                .unwrap_or_else(|| "unknown reason".to_string()),
        )
    });

    let artifact = match &instance.artifact_path {
        Some(path) => read_artifact(path).await,
        None => Err(ArtifactError::Missing {
            path: "<unknown>".to_string(),
        }),
    };
    if let Err(e) = &artifact {
        debug!(probe = %instance.probe_name, error = %e, "Artifact rejected");
    }

    ProbeResult::completed(instance, job_failure, artifact, finished_at)
        .with_usage(completion.wall_clock_secs, completion.cpu_efficiency)
}
