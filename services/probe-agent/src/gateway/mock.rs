//! Mock resource manager for testing and dry runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sitemon_model::{JobHandle, JobSpec};
use tracing::{debug, info};

use super::{Completion, GatewayError, JobStatus, SubmissionGateway};

#[derive(Debug, Clone)]
struct MockJob {
    tag: String,
    status: JobStatus,
    artifact: PathBuf,
}

#[derive(Debug, Default)]
struct MockState {
    jobs: HashMap<JobHandle, MockJob>,
    submissions: Vec<String>,
    removed: Vec<JobHandle>,
    submit_error: Option<String>,
    query_error: Option<String>,
    query_delay: Option<Duration>,
    submit_delay: Option<Duration>,
}

/// Mock gateway.
///
/// By default jobs stay in whatever status the test scripts for them. A
/// simulated gateway instead walks every job through queued, running and
/// completed on successive queries and writes a passing artifact.
pub struct MockGateway {
    /// Counter for generating handles.
    next_id: AtomicU64,

    /// Whether queries advance jobs on their own.
    simulate: bool,

    state: Mutex<MockState>,
}

impl MockGateway {
    /// Create a new mock gateway.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            simulate: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Create a gateway that progresses jobs by itself.
    pub fn simulated() -> Self {
        Self {
            simulate: true,
            ..Self::new()
        }
    }

    /// Create a mock gateway that rejects all submissions.
    pub fn failing() -> Self {
        let gateway = Self::new();
        gateway.fail_submissions(Some("mock gateway configured to fail"));
        gateway
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the mock's state from others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_submissions(&self, error: Option<&str>) {
        self.state().submit_error = error.map(str::to_string);
    }

    pub fn fail_queries(&self, error: Option<&str>) {
        self.state().query_error = error.map(str::to_string);
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state().query_delay = delay;
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.state().submit_delay = delay;
    }

    /// Script the status the next queries for `handle` will return.
    pub fn set_status(&self, handle: &JobHandle, status: JobStatus) {
        if let Some(job) = self.state().jobs.get_mut(handle) {
            job.status = status;
        }
    }

    /// Script every known job.
    pub fn set_all(&self, status: JobStatus) {
        for job in self.state().jobs.values_mut() {
            job.status = status.clone();
        }
    }

    /// Register a job the manager knows but the engine never learned about.
    pub fn insert_tagged(&self, tag: &str, status: JobStatus) -> JobHandle {
        let handle = self.next_handle();
        self.state().jobs.insert(
            handle.clone(),
            MockJob {
                tag: tag.to_string(),
                status,
                artifact: PathBuf::new(),
            },
        );
        handle
    }

    /// Drop a job as if the manager lost track of it.
    pub fn forget(&self, handle: &JobHandle) {
        self.state().jobs.remove(handle);
    }

    /// Tags of every accepted submission, in order.
    pub fn submissions(&self) -> Vec<String> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Handles passed to `remove`, in order.
    pub fn removed(&self) -> Vec<JobHandle> {
        self.state().removed.clone()
    }

    /// Handles of jobs the manager still lists, in submission order.
    pub fn handles(&self) -> Vec<JobHandle> {
        let mut handles: Vec<_> = self.state().jobs.keys().cloned().collect();
        handles.sort_by_key(|h| h.as_str().parse::<u64>().unwrap_or(u64::MAX));
        handles
    }

    fn next_handle(&self) -> JobHandle {
        JobHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionGateway for MockGateway {
    async fn submit(&self, spec: &JobSpec, tag: &str) -> Result<JobHandle, GatewayError> {
        let delay = self.state().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.state().submit_error.clone() {
            return Err(GatewayError::Rejected(error));
        }

        let handle = self.next_handle();
        info!(tag = %tag, handle = %handle, "[MOCK] Job submitted");

        let mut state = self.state();
        state.submissions.push(tag.to_string());
        state.jobs.insert(
            handle.clone(),
            MockJob {
                tag: tag.to_string(),
                status: JobStatus::Queued,
                artifact: spec.result_file_for(&handle),
            },
        );
        Ok(handle)
    }

    async fn query(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError> {
        let delay = self.state().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (status, write_artifact) = {
            let mut state = self.state();
            if let Some(error) = state.query_error.clone() {
                return Err(GatewayError::Unreachable(error));
            }
            let Some(job) = state.jobs.get_mut(handle) else {
                return Ok(JobStatus::NotFound);
            };

            let was_completed = matches!(job.status, JobStatus::Completed(_));
            if self.simulate {
                job.status = match job.status.clone() {
                    JobStatus::Queued => JobStatus::Running,
                    JobStatus::Running => JobStatus::Completed(Completion::succeeded()),
                    other => other,
                };
            }
            let finished_now =
                self.simulate && !was_completed && matches!(job.status, JobStatus::Completed(_));
            (job.status.clone(), finished_now.then(|| job.artifact.clone()))
        };

        if let Some(path) = write_artifact {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(
                &path,
                "tests:\n  - name: simulated\n    passed: true\n    message: \"simulated run\"\n",
            )
            .await?;
        }

        debug!(handle = %handle, status = ?status, "[MOCK] Job queried");
        Ok(status)
    }

    async fn remove(&self, handle: &JobHandle) -> Result<(), GatewayError> {
        info!(handle = %handle, "[MOCK] Removing job");
        let mut state = self.state();
        state.removed.push(handle.clone());
        state.jobs.remove(handle);
        Ok(())
    }

    async fn lookup(&self, tag: &str) -> Result<Option<JobHandle>, GatewayError> {
        if let Some(error) = self.state().query_error.clone() {
            return Err(GatewayError::Unreachable(error));
        }
        Ok(self
            .state()
            .jobs
            .iter()
            .find(|(_, job)| job.tag == tag)
            .map(|(handle, _)| handle.clone()))
    }
}
