//! Parsed test records and the aggregate probe outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::failure::ProbeFailure;
use crate::instance::JobInstance;
use crate::probe::JobHandle;

/// One record of a result artifact.
///
/// The artifact spells the identifier `name`; `test` is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestResult {
    #[serde(rename = "name", alias = "test")]
    pub test: String,
    pub passed: bool,
    pub message: String,
}

/// Outcome of one instance, as reported to the metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_name: String,
    pub site: String,
    pub instance_submitted_at: DateTime<Utc>,
    /// When the instance reached its terminal state.
    pub finished_at: DateTime<Utc>,
    pub handle: Option<JobHandle>,
    pub overall_passed: bool,
    /// Test records in artifact order.
    pub tests: Vec<TestResult>,
    /// Set when the instance failed for infrastructure rather than test reasons.
    pub failure_reason: Option<String>,
    /// Wall-clock runtime reported by the resource manager.
    #[serde(default)]
    pub runtime_secs: Option<f64>,
    /// `(user + sys cpu) / wall-clock`, when accounted.
    #[serde(default)]
    pub cpu_efficiency: Option<f64>,
}

impl ProbeResult {
    /// A failing result with no test records.
    pub fn failure(
        instance: &JobInstance,
        failure: &ProbeFailure,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            probe_name: instance.probe_name.clone(),
            site: instance.site.clone(),
            instance_submitted_at: instance.submitted_at,
            finished_at,
            handle: instance.external_handle.clone(),
            overall_passed: false,
            tests: Vec::new(),
            failure_reason: Some(failure.to_string()),
            runtime_secs: None,
            cpu_efficiency: None,
        }
    }

    /// Result of a completed instance.
    ///
    /// Passes only if the job itself succeeded, the artifact parsed, it holds
    /// at least one record, and every record passed.
    pub fn completed(
        instance: &JobInstance,
        job_failure: Option<ProbeFailure>,
        artifact: Result<Vec<TestResult>, ArtifactError>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let (tests, artifact_failure) = match artifact {
            Ok(tests) => (tests, None),
            Err(e) => (Vec::new(), Some(ProbeFailure::Validation(e))),
        };
        let failure = job_failure.or(artifact_failure);
        let overall_passed =
            failure.is_none() && !tests.is_empty() && tests.iter().all(|t| t.passed);

        Self {
            probe_name: instance.probe_name.clone(),
            site: instance.site.clone(),
            instance_submitted_at: instance.submitted_at,
            finished_at,
            handle: instance.external_handle.clone(),
            overall_passed,
            tests,
            failure_reason: failure.map(|f| f.to_string()),
            runtime_secs: None,
            cpu_efficiency: None,
        }
    }

    /// Attach resource-manager accounting.
    pub fn with_usage(mut self, runtime_secs: Option<f64>, cpu_efficiency: Option<f64>) -> Self {
        self.runtime_secs = runtime_secs;
        self.cpu_efficiency = cpu_efficiency;
        self
    }

    /// Seconds from submission to termination.
    pub fn test_duration_secs(&self) -> f64 {
        (self.finished_at - self.instance_submitted_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestResult> {
        self.tests.iter().filter(|t| !t.passed)
    }

    /// Human readable one-line verdict.
    pub fn summary(&self) -> String {
        if self.overall_passed {
            return "Job succeeded".to_string();
        }

        let mut message = String::from("Job failed");
        if let Some(reason) = &self.failure_reason {
            message.push_str(" - ");
            message.push_str(reason);
        }
        let failed: Vec<&str> = self.failed_tests().map(|t| t.message.as_str()).collect();
        if !failed.is_empty() {
            message.push_str(&format!(" - Tests failed: {failed:?}"));
        }
        message
    }
}
