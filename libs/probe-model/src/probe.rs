//! Probe definitions and the job payload handed to the resource manager.

use std::fmt;
use std::path::PathBuf;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Placeholder substituted with the external job handle in per-instance paths.
pub const HANDLE_PLACEHOLDER: &str = "{handle}";

/// Upper bound for a probe's interval and timeout, one year.
pub const MAX_PERIOD_SECS: u64 = 366 * 24 * 3600;

/// A configured, periodically executed probe.
///
/// Owned by the configuration loader; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    /// Unique name, used as the persistence key.
    pub name: String,
    /// Disabled probes are never scheduled.
    pub enabled: bool,
    /// Label attached to reported results.
    pub site: String,
    /// Seconds between submissions.
    pub interval_secs: u64,
    /// Seconds an instance may take before it is timed out.
    pub timeout_secs: u64,
    /// Opaque payload for the submission gateway.
    pub job: JobSpec,
}

impl ProbeDefinition {
    /// Interval between submissions, capped at [`MAX_PERIOD_SECS`].
    pub fn interval(&self) -> Duration {
        capped_seconds(self.interval_secs)
    }

    /// Time an instance may run, capped at [`MAX_PERIOD_SECS`].
    pub fn timeout(&self) -> Duration {
        capped_seconds(self.timeout_secs)
    }

    /// Returns true if a new instance could be requested while the previous
    /// one is still allowed to run.
    pub fn may_overlap(&self) -> bool {
        self.timeout_secs > self.interval_secs
    }
}

/// What the resource manager should run for one instance of a probe.
///
/// Paths containing [`HANDLE_PLACEHOLDER`] are resolved per instance once a
/// handle is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: String,
    pub universe: String,
    #[serde(default)]
    pub input_files: Vec<PathBuf>,
    /// Name of the artifact the probe writes in its scratch directory.
    pub output_file: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Resource manager event log.
    pub log: PathBuf,
    /// Where the artifact lands after transfer back.
    pub result_file: PathBuf,
    pub resources: ResourceRequest,
}

impl JobSpec {
    /// Resolve the artifact path for a submitted instance.
    pub fn result_file_for(&self, handle: &JobHandle) -> PathBuf {
        substitute_handle(&self.result_file, handle)
    }

    pub fn stdout_for(&self, handle: &JobHandle) -> PathBuf {
        substitute_handle(&self.stdout, handle)
    }

    pub fn stderr_for(&self, handle: &JobHandle) -> PathBuf {
        substitute_handle(&self.stderr, handle)
    }
}

fn capped_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_PERIOD_SECS) as i64)
}

fn substitute_handle(path: &std::path::Path, handle: &JobHandle) -> PathBuf {
    PathBuf::from(
        path.to_string_lossy()
            .replace(HANDLE_PLACEHOLDER, handle.as_str()),
    )
}

/// Resource requests forwarded to the resource manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: u32,
    /// Memory request in the manager's own notation (e.g. `2GB`, `2048`).
    pub memory: String,
    pub disk: String,
    #[serde(default)]
    pub gpus: u32,
    /// Additional matchmaking expression.
    #[serde(default)]
    pub requirements: Option<String>,
}

/// Opaque identifier assigned by the resource manager on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub(crate) fn sample_probe(name: &str) -> ProbeDefinition {
    let logs = format!("/var/lib/sitemon/logs/{name}");
    ProbeDefinition {
        name: name.to_string(),
        enabled: true,
        site: "site-a".to_string(),
        interval_secs: 300,
        timeout_secs: 120,
        job: JobSpec {
            executable: PathBuf::from(format!("/etc/sitemon/{name}/run.sh")),
            arguments: "--quick".to_string(),
            universe: "vanilla".to_string(),
            input_files: vec![],
            output_file: "result.yml".to_string(),
            stdout: PathBuf::from(format!("{logs}/{{handle}}_out.log")),
            stderr: PathBuf::from(format!("{logs}/{{handle}}_err.log")),
            log: PathBuf::from(format!("{logs}/condor.log")),
            result_file: PathBuf::from(format!(
                "/var/lib/sitemon/results/{name}/id_{{handle}}-0-result.yml"
            )),
            resources: ResourceRequest {
                cpus: 1,
                memory: "512MB".to_string(),
                disk: "1GB".to_string(),
                gpus: 0,
                requirements: None,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_periods_are_capped() {
        let mut probe = sample_probe("disk-check");
        probe.interval_secs = u64::MAX;
        probe.timeout_secs = 100_000_000_000_000_000;
        assert_eq!(probe.interval(), Duration::seconds(MAX_PERIOD_SECS as i64));
        assert_eq!(probe.timeout(), Duration::seconds(MAX_PERIOD_SECS as i64));
    }

    #[test]
    fn test_result_file_substitutes_handle() {
        let probe = sample_probe("disk-check");
        let path = probe.job.result_file_for(&JobHandle::new("4711"));
        assert_eq!(
            path,
            PathBuf::from("/var/lib/sitemon/results/disk-check/id_4711-0-result.yml")
        );
        assert_eq!(
            probe.job.stdout_for(&JobHandle::new("4711")),
            PathBuf::from("/var/lib/sitemon/logs/disk-check/4711_out.log")
        );
    }

    #[test]
    fn test_overlap_detection() {
        let mut probe = sample_probe("disk-check");
        assert!(!probe.may_overlap());

        probe.timeout_secs = 600;
        assert!(probe.may_overlap());
        assert_eq!(probe.timeout(), Duration::seconds(600));
    }
}
