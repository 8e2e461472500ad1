//! Lifecycle tracker: the per-instance state machine.
//!
//! Every probe name owns one slot. A slot is an async mutex around the
//! probe's active instance, and holding its guard (a [`SlotToken`]) is the
//! only way to start or advance an instance. Callers take tokens with
//! [`LifecycleTracker::claim`], which never waits: a busy slot means another
//! operation is already driving that probe, so the caller defers.
//!
//! Ordering per transition:
//! 1. persist the new state
//! 2. perform the externally visible side effect (removal, sink write)
//!
//! A crash between the two is recovered by [`LifecycleTracker::recover`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sitemon_model::{
    InstanceState, JobHandle, JobInstance, ModelError, ProbeDefinition, ProbeFailure, ProbeResult,
};
use thiserror::Error;
use tokio::sync::{Mutex as SlotMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::gateway::{Completion, JobStatus, SubmissionGateway};
use crate::sink::ResultReporter;
use crate::state::{StateStore, StateStoreError};
use crate::validator;

/// Errors that stop a single probe's step. They never affect other probes.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Client-side bound on status queries and lookups.
    pub query_timeout: Duration,

    /// Client-side bound on submissions.
    pub submit_timeout: Duration,

    /// Delete the artifact and job output of a passing instance once it has
    /// been reported.
    pub cleanup_on_pass: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(30),
            cleanup_on_pass: true,
        }
    }
}

/// What one step did to a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The slot was held by another operation.
    Busy,
    /// Nothing was due.
    Idle,
    /// A new instance was created and is now in this state.
    Started(InstanceState),
    /// The active instance was polled and is now in this state.
    Advanced(InstanceState),
}

impl Step {
    /// Returns true if the step ended in a terminal state.
    pub fn is_terminal(&self) -> bool {
        match self {
            Step::Started(state) | Step::Advanced(state) => state.is_terminal(),
            Step::Busy | Step::Idle => false,
        }
    }
}

/// Summary of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Submitted or running instances resumed for polling.
    pub resumed: usize,
    /// Pending instances whose job was found again.
    pub reconciled: usize,
    /// Pending instances whose job was never accepted.
    pub interrupted: usize,
    /// Pending instances still unresolved, retried on the next poll.
    pub unresolved: usize,
    /// Persisted outcomes delivered again.
    pub resent: usize,
}

/// How an instance reached its terminal state.
enum Outcome {
    Failed(ProbeFailure),
    Completed {
        result: ProbeResult,
        completion: Completion,
    },
}

#[derive(Debug, Default)]
struct Slot {
    active: Option<JobInstance>,
    last_submitted_at: Option<DateTime<Utc>>,
    /// The active instance holds a transition not yet in the store.
    checkpoint_pending: bool,
    initialized: bool,
}

/// Exclusive right to operate on one probe's slot.
pub struct SlotToken {
    probe_name: String,
    slot: OwnedMutexGuard<Slot>,
}

impl SlotToken {
    pub fn probe_name(&self) -> &str {
        &self.probe_name
    }

    /// The probe's non-terminal instance, if any.
    pub fn active(&self) -> Option<&JobInstance> {
        self.slot.active.as_ref()
    }

    /// When the probe was last submitted, persisted across restarts.
    pub fn last_submitted_at(&self) -> Option<DateTime<Utc>> {
        self.slot.last_submitted_at
    }
}

/// Owns every job instance and drives it through its lifecycle.
pub struct LifecycleTracker {
    gateway: Arc<dyn SubmissionGateway>,
    store: Arc<StateStore>,
    reporter: ResultReporter,
    slots: Mutex<HashMap<String, Arc<SlotMutex<Slot>>>>,
    config: TrackerConfig,
}

impl LifecycleTracker {
    pub fn new(
        gateway: Arc<dyn SubmissionGateway>,
        store: Arc<StateStore>,
        reporter: ResultReporter,
        config: TrackerConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            reporter,
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<SlotMutex<Slot>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, probe_name: &str) -> Arc<SlotMutex<Slot>> {
        Arc::clone(self.slots().entry(probe_name.to_string()).or_default())
    }

    /// Names of every probe that has had a slot.
    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots().keys().cloned().collect();
        names.sort();
        names
    }

    /// Try to take a probe's slot without waiting.
    pub fn claim(&self, probe_name: &str) -> Result<Option<SlotToken>, TrackerError> {
        let Ok(mut slot) = self.slot(probe_name).try_lock_owned() else {
            debug!(probe = %probe_name, "Slot busy, deferring");
            return Ok(None);
        };
        if !slot.initialized {
            slot.last_submitted_at = self.store.last_submission(probe_name)?;
            slot.initialized = true;
        }
        Ok(Some(SlotToken {
            probe_name: probe_name.to_string(),
            slot,
        }))
    }

    /// Snapshot of a probe's active instance, waiting for its slot.
    pub async fn active(&self, probe_name: &str) -> Option<JobInstance> {
        let slot = self.slot(probe_name);
        let guard = slot.lock().await;
        guard.active.clone()
    }

    /// Create and submit a new instance of `probe`.
    ///
    /// The slot must be free of an active instance.
    pub async fn start(
        &self,
        token: &mut SlotToken,
        probe: &ProbeDefinition,
        now: DateTime<Utc>,
    ) -> Result<Step, TrackerError> {
        if let Some(active) = token.active() {
            warn!(
                probe = %probe.name,
                state = %active.state,
                "Refusing to start a second active instance"
            );
            return Ok(Step::Busy);
        }

        let mut instance = JobInstance::pending(probe, now);
        self.store.upsert(&instance)?;
        token.slot.last_submitted_at = Some(instance.submitted_at);

        let tag = instance.tag();
        let failure = match timeout(self.config.submit_timeout, self.gateway.submit(&probe.job, &tag))
            .await
        {
            Ok(Ok(handle)) => {
                let artifact = probe.job.result_file_for(&handle);
                instance.mark_submitted(handle, artifact, now)?;
                info!(
                    probe = %probe.name,
                    handle = ?instance.external_handle,
                    deadline = %instance.deadline,
                    "Instance submitted"
                );
                token.slot.active = Some(instance);
                self.checkpoint(&mut token.slot);
                return Ok(Step::Started(InstanceState::Submitted));
            }
            Ok(Err(e)) => ProbeFailure::Submission(e.to_string()),
            Err(_) => ProbeFailure::Submission(format!(
                "no answer within {}s",
                self.config.submit_timeout.as_secs()
            )),
        };

        warn!(probe = %probe.name, error = %failure, "Submission failed");
        let state = self
            .finish(
                token,
                instance,
                Some(probe),
                InstanceState::SubmitFailed,
                Outcome::Failed(failure),
                now,
            )
            .await?;
        Ok(Step::Started(state))
    }

    /// Poll the slot's active instance once.
    ///
    /// `probe` is the current definition, if the probe is still configured.
    pub async fn advance(
        &self,
        token: &mut SlotToken,
        probe: Option<&ProbeDefinition>,
        now: DateTime<Utc>,
    ) -> Result<Step, TrackerError> {
        let Some(instance) = token.slot.active.clone() else {
            return Ok(Step::Idle);
        };

        if token.slot.checkpoint_pending {
            self.checkpoint(&mut token.slot);
        }

        let state = match instance.state {
            InstanceState::Pending => self.reconcile_pending(token, instance, probe, now).await?,
            InstanceState::Submitted | InstanceState::Running => {
                self.poll(token, instance, probe, now).await?
            }
            terminal => {
                error!(
                    probe = %instance.probe_name,
                    state = %terminal,
                    "Terminal instance found in active slot"
                );
                token.slot.active = None;
                return Ok(Step::Idle);
            }
        };
        Ok(Step::Advanced(state))
    }

    async fn poll(
        &self,
        token: &mut SlotToken,
        mut instance: JobInstance,
        probe: Option<&ProbeDefinition>,
        now: DateTime<Utc>,
    ) -> Result<InstanceState, TrackerError> {
        let Some(handle) = instance.external_handle.clone() else {
            let failure = ProbeFailure::Query("no handle recorded".to_string());
            let outcome = Outcome::Failed(failure);
            return self
                .finish(token, instance, probe, InstanceState::InfraError, outcome, now)
                .await;
        };

        let status = match timeout(self.config.query_timeout, self.gateway.query(&handle)).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(ProbeFailure::Query(e.to_string())),
            Err(_) => Err(ProbeFailure::Query(format!(
                "no answer within {}s",
                self.config.query_timeout.as_secs()
            ))),
        };
        debug!(probe = %instance.probe_name, handle = %handle, status = ?status, "Polled instance");

        match status {
            // A job that finished before we noticed the deadline is not penalized.
            Ok(JobStatus::Completed(completion)) => {
                let result = validator::evaluate(&instance, &completion, now).await;
                let outcome = Outcome::Completed { result, completion };
                self.finish(token, instance, probe, InstanceState::Completed, outcome, now)
                    .await
            }
            _ if instance.is_overdue(now) => {
                info!(probe = %instance.probe_name, handle = %handle, "Instance timed out");
                let outcome = Outcome::Failed(ProbeFailure::Timeout);
                self.finish(token, instance, probe, InstanceState::TimedOut, outcome, now)
                    .await
            }
            Ok(JobStatus::Queued) => Ok(instance.state),
            Ok(JobStatus::Running) => {
                if instance.state == InstanceState::Submitted {
                    instance.transition(InstanceState::Running, now)?;
                    info!(probe = %instance.probe_name, handle = %handle, "Instance running");
                    token.slot.active = Some(instance);
                    self.checkpoint(&mut token.slot);
                }
                Ok(InstanceState::Running)
            }
            Ok(JobStatus::NotFound) => {
                warn!(probe = %instance.probe_name, handle = %handle, "Job vanished from resource manager");
                let outcome = Outcome::Failed(ProbeFailure::NotFound);
                self.finish(token, instance, probe, InstanceState::InfraError, outcome, now)
                    .await
            }
            Err(failure) => {
                warn!(probe = %instance.probe_name, handle = %handle, error = %failure, "Status query failed");
                let outcome = Outcome::Failed(failure);
                self.finish(token, instance, probe, InstanceState::InfraError, outcome, now)
                    .await
            }
        }
    }

    /// Resolve an instance persisted as `PENDING` whose handle was never
    /// recorded, by looking its tag up in the resource manager.
    async fn reconcile_pending(
        &self,
        token: &mut SlotToken,
        mut instance: JobInstance,
        probe: Option<&ProbeDefinition>,
        now: DateTime<Utc>,
    ) -> Result<InstanceState, TrackerError> {
        let tag = instance.tag();
        let lookup = timeout(self.config.query_timeout, self.gateway.lookup(&tag)).await;

        match lookup {
            Ok(Ok(Some(handle))) => {
                instance.transition(InstanceState::Submitted, now)?;
                instance.artifact_path = probe.map(|p| p.job.result_file_for(&handle));
                info!(probe = %instance.probe_name, handle = %handle, "Recovered interrupted submission");
                instance.external_handle = Some(handle);
                token.slot.active = Some(instance);
                self.checkpoint(&mut token.slot);
                Ok(InstanceState::Submitted)
            }
            Ok(Ok(None)) => {
                info!(probe = %instance.probe_name, tag = %tag, "Interrupted submission never reached the resource manager");
                let outcome = Outcome::Failed(ProbeFailure::Interrupted);
                self.finish(token, instance, probe, InstanceState::SubmitFailed, outcome, now)
                    .await
            }
            Ok(Err(_)) | Err(_) if instance.is_overdue(now) => {
                let failure = ProbeFailure::Query(format!("could not resolve submission {tag}"));
                let outcome = Outcome::Failed(failure);
                self.finish(token, instance, probe, InstanceState::InfraError, outcome, now)
                    .await
            }
            Ok(Err(e)) => {
                warn!(probe = %instance.probe_name, error = %e, "Lookup failed, will retry");
                Ok(InstanceState::Pending)
            }
            Err(_) => {
                warn!(probe = %instance.probe_name, "Lookup timed out, will retry");
                Ok(InstanceState::Pending)
            }
        }
    }

    /// Move an instance to a terminal state, persist its outcome, then
    /// perform the side effects.
    ///
    /// If the outcome cannot be persisted the instance stays active in its
    /// previous state and the transition is retried on the next poll.
    async fn finish(
        &self,
        token: &mut SlotToken,
        instance: JobInstance,
        probe: Option<&ProbeDefinition>,
        to: InstanceState,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<InstanceState, TrackerError> {
        let mut terminal = instance.clone();
        let (result, job_succeeded) = match outcome {
            Outcome::Failed(failure) => {
                terminal.fail(to, failure.to_string(), now)?;
                (ProbeResult::failure(&terminal, &failure, now), true)
            }
            Outcome::Completed { result, completion } => {
                terminal.transition(to, now)?;
                terminal.last_error = result.failure_reason.clone();
                (result, completion.succeeded)
            }
        };

        if let Err(e) = self.store.record_outcome(&terminal, &result) {
            token.slot.active = Some(instance);
            token.slot.checkpoint_pending = false;
            return Err(e.into());
        }
        token.slot.active = None;
        token.slot.checkpoint_pending = false;

        info!(
            probe = %terminal.probe_name,
            state = %terminal.state,
            passed = result.overall_passed,
            summary = %result.summary(),
            "Instance finished"
        );

        // Timed out and held jobs would otherwise stay in the queue.
        if to == InstanceState::TimedOut || !job_succeeded {
            if let Some(handle) = terminal.external_handle.clone() {
                self.remove_in_background(handle);
            }
        }

        self.deliver(&terminal, probe, &result).await;
        Ok(to)
    }

    /// Hand an outcome to the sink and note the attempt, then clean up.
    ///
    /// Job output is only known through the probe definition, so it is kept
    /// for instances of probes no longer configured.
    async fn deliver(
        &self,
        instance: &JobInstance,
        probe: Option<&ProbeDefinition>,
        result: &ProbeResult,
    ) {
        self.reporter.report(result).await;
        if let Err(e) = self.store.mark_reported(&instance.key()) {
            warn!(probe = %instance.probe_name, error = %e, "Failed to mark outcome reported");
        }

        if !self.config.cleanup_on_pass || !result.overall_passed {
            return;
        }
        let mut outputs: Vec<PathBuf> = instance.artifact_path.iter().cloned().collect();
        if let (Some(probe), Some(handle)) = (probe, &instance.external_handle) {
            outputs.push(probe.job.stdout_for(handle));
            outputs.push(probe.job.stderr_for(handle));
        }
        for path in outputs {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed job output"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove job output"),
            }
        }
    }

    fn remove_in_background(&self, handle: JobHandle) {
        let gateway = Arc::clone(&self.gateway);
        let limit = self.config.query_timeout;
        tokio::spawn(async move {
            match timeout(limit, gateway.remove(&handle)).await {
                Ok(Ok(())) => debug!(handle = %handle, "Job removed"),
                Ok(Err(e)) => debug!(handle = %handle, error = %e, "Job removal failed"),
                Err(_) => debug!(handle = %handle, "Job removal timed out"),
            }
        });
    }

    fn checkpoint(&self, slot: &mut Slot) {
        let Some(instance) = &slot.active else {
            return;
        };
        match self.store.upsert(instance) {
            Ok(()) => slot.checkpoint_pending = false,
            Err(e) => {
                error!(
                    probe = %instance.probe_name,
                    state = %instance.state,
                    error = %e,
                    "Failed to checkpoint instance, will retry"
                );
                slot.checkpoint_pending = true;
            }
        }
    }

    /// Rebuild slots from the store after a restart.
    ///
    /// Submitted and running instances resume polling. Pending instances are
    /// looked up by tag. Outcomes persisted but never delivered are sent again.
    pub async fn recover(
        &self,
        probes: &[ProbeDefinition],
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport, TrackerError> {
        let mut report = RecoveryReport::default();

        for instance in self.store.load_active()? {
            let name = instance.probe_name.clone();
            let probe = probes.iter().find(|p| p.name == name);
            let mut token = SlotToken {
                probe_name: name.clone(),
                slot: self.slot(&name).lock_owned().await,
            };
            if let Some(active) = token.active() {
                warn!(
                    probe = %name,
                    kept = %active.key(),
                    dropped = %instance.key(),
                    "More than one active instance persisted"
                );
                continue;
            }
            token.slot.last_submitted_at = self.store.last_submission(&name)?;
            token.slot.initialized = true;

            if instance.state != InstanceState::Pending {
                info!(probe = %name, state = %instance.state, "Resuming instance");
                token.slot.active = Some(instance);
                report.resumed += 1;
                continue;
            }

            token.slot.active = Some(instance.clone());
            match self.reconcile_pending(&mut token, instance, probe, now).await? {
                InstanceState::Submitted => report.reconciled += 1,
                InstanceState::Pending => report.unresolved += 1,
                _ => report.interrupted += 1,
            }
        }

        for (instance, result) in self.store.load_unreported()? {
            info!(probe = %instance.probe_name, state = %instance.state, "Re-sending undelivered outcome");
            let probe = probes.iter().find(|p| p.name == instance.probe_name);
            self.deliver(&instance, probe, &result).await;
            report.resent += 1;
        }

        info!(
            resumed = report.resumed,
            reconciled = report.reconciled,
            interrupted = report.interrupted,
            unresolved = report.unresolved,
            resent = report.resent,
            "Recovery complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::gateway::MockGateway;
    use crate::sink::MemorySink;
    use crate::testing::{probe, probe_in, write_passing_artifact};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct Harness {
        gateway: Arc<MockGateway>,
        store: Arc<StateStore>,
        sink: Arc<MemorySink>,
        tracker: LifecycleTracker,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let tracker = LifecycleTracker::new(
            gateway.clone(),
            store.clone(),
            ResultReporter::new(sink.clone()),
            TrackerConfig::default(),
        );
        Harness {
            gateway,
            store,
            sink,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_start_persists_submitted_instance() {
        let h = harness();
        let probe = probe("disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        let step = h.tracker.start(&mut token, &probe, at(0)).await.unwrap();

        assert_eq!(step, Step::Started(InstanceState::Submitted));
        assert_eq!(token.last_submitted_at(), Some(at(0)));
        let persisted = h.store.load_active().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].state, InstanceState::Submitted);
        assert_eq!(persisted[0].external_handle, Some(JobHandle::new("1")));
        assert_eq!(h.gateway.submissions(), vec![persisted[0].tag()]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let h = harness();
        let token = h.tracker.claim("disk-check").unwrap();
        assert!(token.is_some());
        assert!(h.tracker.claim("disk-check").unwrap().is_none());
        assert!(h.tracker.claim("net-check").unwrap().is_some());

        drop(token);
        assert!(h.tracker.claim("disk-check").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_refuses_second_instance() {
        let h = harness();
        let probe = probe("disk-check", 60, 600);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        let step = h.tracker.start(&mut token, &probe, at(60)).await.unwrap();

        assert_eq!(step, Step::Busy);
        assert_eq!(h.gateway.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_failure_is_reported() {
        let h = harness();
        h.gateway.fail_submissions(Some("schedd unreachable"));
        let probe = probe("disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        let step = h.tracker.start(&mut token, &probe, at(0)).await.unwrap();

        assert_eq!(step, Step::Started(InstanceState::SubmitFailed));
        assert!(token.active().is_none());
        let results = h.sink.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].overall_passed);
        assert_eq!(
            results[0].failure_reason.as_deref(),
            Some("submission failed: rejected by resource manager: schedd unreachable")
        );
    }

    #[tokio::test]
    async fn test_running_then_completed() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        let probe = probe_in(dir.path(), "disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        let handle = token.active().unwrap().external_handle.clone().unwrap();

        h.gateway.set_status(&handle, JobStatus::Running);
        let step = h.tracker.advance(&mut token, Some(&probe), at(10)).await.unwrap();
        assert_eq!(step, Step::Advanced(InstanceState::Running));
        assert_eq!(h.store.load_active().unwrap()[0].state, InstanceState::Running);

        let artifact = probe.job.result_file_for(&handle);
        write_passing_artifact(&artifact, &["read", "write"]).unwrap();
        let stdout = probe.job.stdout_for(&handle);
        let stderr = probe.job.stderr_for(&handle);
        std::fs::create_dir_all(stdout.parent().unwrap()).unwrap();
        std::fs::write(&stdout, "ok\n").unwrap();
        std::fs::write(&stderr, "").unwrap();
        h.gateway
            .set_status(&handle, JobStatus::Completed(Completion::succeeded()));
        let step = h.tracker.advance(&mut token, Some(&probe), at(20)).await.unwrap();

        assert_eq!(step, Step::Advanced(InstanceState::Completed));
        assert!(token.active().is_none());
        let result = &h.sink.results()[0];
        assert!(result.overall_passed);
        assert_eq!(result.tests.len(), 2);
        assert!(!artifact.exists(), "passing artifact should be cleaned up");
        assert!(!stdout.exists());
        assert!(!stderr.exists());
        assert!(h.store.load_unreported().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_outcome_write_keeps_instance_active() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        let probe = probe_in(dir.path(), "disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        let handle = token.active().unwrap().external_handle.clone().unwrap();
        h.gateway.set_status(&handle, JobStatus::Running);
        h.tracker.advance(&mut token, Some(&probe), at(10)).await.unwrap();

        write_passing_artifact(&probe.job.result_file_for(&handle), &["read"]).unwrap();
        h.gateway
            .set_status(&handle, JobStatus::Completed(Completion::succeeded()));
        h.store.reject_writes();

        let err = h
            .tracker
            .advance(&mut token, Some(&probe), at(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Store(_)), "got {err:?}");
        assert_eq!(token.active().unwrap().state, InstanceState::Running);
        assert_eq!(h.store.load_active().unwrap()[0].state, InstanceState::Running);
        assert!(h.sink.results().is_empty());

        h.store.accept_writes();
        let step = h.tracker.advance(&mut token, Some(&probe), at(30)).await.unwrap();
        assert_eq!(step, Step::Advanced(InstanceState::Completed));
        assert!(token.active().is_none());
        assert!(h.store.load_active().unwrap().is_empty());
        assert_eq!(h.sink.results().len(), 1);
        assert!(h.sink.results()[0].overall_passed);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_is_retried_on_next_advance() {
        let h = harness();
        let probe = probe("disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        let handle = token.active().unwrap().external_handle.clone().unwrap();

        h.store.reject_writes();
        h.gateway.set_status(&handle, JobStatus::Running);
        let step = h.tracker.advance(&mut token, Some(&probe), at(10)).await.unwrap();
        assert_eq!(step, Step::Advanced(InstanceState::Running));
        assert_eq!(token.active().unwrap().state, InstanceState::Running);
        assert_eq!(h.store.load_active().unwrap()[0].state, InstanceState::Submitted);

        h.store.accept_writes();
        h.tracker.advance(&mut token, Some(&probe), at(20)).await.unwrap();
        let persisted = h.store.get(&token.active().unwrap().key()).unwrap().unwrap();
        assert_eq!(persisted.state, InstanceState::Running);
        assert!(h.sink.results().is_empty());
    }

    #[tokio::test]
    async fn test_query_error_is_infra_error() {
        let h = harness();
        let probe = probe("disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        h.gateway.fail_queries(Some("collector down"));

        let step = h.tracker.advance(&mut token, Some(&probe), at(10)).await.unwrap();
        assert_eq!(step, Step::Advanced(InstanceState::InfraError));
        let reason = h.sink.results()[0].failure_reason.clone().unwrap();
        assert!(reason.starts_with("status query failed"), "{reason}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_is_infra_error() {
        let h = harness();
        let probe = probe("disk-check", 300, 120);

        let mut token = h.tracker.claim("disk-check").unwrap().unwrap();
        h.tracker.start(&mut token, &probe, at(0)).await.unwrap();
        h.gateway.set_query_delay(Some(Duration::from_secs(300)));

        let step = h.tracker.advance(&mut token, Some(&probe), at(10)).await.unwrap();
        assert_eq!(step, Step::Advanced(InstanceState::InfraError));
        assert_eq!(
            h.sink.results()[0].failure_reason.as_deref(),
            Some("status query failed: no answer within 30s")
        );
    }

    #[tokio::test]
    async fn test_recover_reconciles_pending() {
        let h = harness();
        let probe = probe("disk-check", 300, 120);

        let found = JobInstance::pending(&probe, at(0));
        h.store.upsert(&found).unwrap();
        let handle = h.gateway.insert_tagged(&found.tag(), JobStatus::Running);

        let other = probe_in(std::path::Path::new("/tmp"), "net-check", 300, 120);
        let lost = JobInstance::pending(&other, at(5));
        h.store.upsert(&lost).unwrap();

        let report = h
            .tracker
            .recover(&[probe.clone(), other.clone()], at(30))
            .await
            .unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.interrupted, 1);

        let active = h.tracker.active("disk-check").await.unwrap();
        assert_eq!(active.state, InstanceState::Submitted);
        assert_eq!(active.external_handle, Some(handle.clone()));
        assert_eq!(active.artifact_path, Some(probe.job.result_file_for(&handle)));

        assert!(h.tracker.active("net-check").await.is_none());
        let results = h.sink.results_for("net-check");
        assert_eq!(
            results[0].failure_reason.as_deref(),
            Some("submission interrupted before a handle was recorded")
        );
    }
}
