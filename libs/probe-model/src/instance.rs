//! Job instances and their lifecycle states.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::probe::{JobHandle, ProbeDefinition};

/// Lifecycle state of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Created, not yet accepted by the resource manager.
    Pending,
    /// Accepted by the resource manager; a handle is assigned.
    Submitted,
    /// Observed executing.
    Running,
    /// Finished; the result artifact has been evaluated.
    Completed,
    /// Did not finish before its deadline.
    TimedOut,
    /// The resource manager did not accept the submission.
    SubmitFailed,
    /// Status could not be determined.
    InfraError,
}

impl InstanceState {
    pub const ALL: [InstanceState; 7] = [
        Self::Pending,
        Self::Submitted,
        Self::Running,
        Self::Completed,
        Self::TimedOut,
        Self::SubmitFailed,
        Self::InfraError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::SubmitFailed => "SUBMIT_FAILED",
            Self::InfraError => "INFRA_ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::SubmitFailed | Self::InfraError
        )
    }

    /// Returns true if `to` is a legal successor of this state.
    pub fn can_transition_to(&self, to: InstanceState) -> bool {
        use InstanceState::*;
        match (self, to) {
            (Pending, Submitted | SubmitFailed | InfraError) => true,
            (Submitted, Running | Completed | TimedOut | InfraError) => true,
            (Running, Completed | TimedOut | InfraError) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ModelError::UnknownState(s.to_string()))
    }
}

/// Identity of an instance: probe name plus submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub probe_name: String,
    pub submitted_at: DateTime<Utc>,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.probe_name,
            self.submitted_at.timestamp_millis()
        )
    }
}

/// One concrete execution attempt of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub probe_name: String,
    pub site: String,
    pub submitted_at: DateTime<Utc>,
    /// Empty until the resource manager accepts the job.
    pub external_handle: Option<JobHandle>,
    pub state: InstanceState,
    /// `submitted_at + timeout`.
    pub deadline: DateTime<Utc>,
    /// Resolved artifact location, known once a handle exists.
    pub artifact_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    /// Create a `PENDING` instance for `probe` at `now`.
    ///
    /// Timestamps are truncated to milliseconds, the resolution of the store.
    pub fn pending(probe: &ProbeDefinition, now: DateTime<Utc>) -> Self {
        let submitted_at = now.trunc_subsecs(3);
        Self {
            probe_name: probe.name.clone(),
            site: probe.site.clone(),
            submitted_at,
            external_handle: None,
            state: InstanceState::Pending,
            deadline: submitted_at
                .checked_add_signed(probe.timeout())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            artifact_path: None,
            last_error: None,
            updated_at: submitted_at,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            probe_name: self.probe_name.clone(),
            submitted_at: self.submitted_at,
        }
    }

    /// Tag attached to the external job so it can be found again after a
    /// crash that lost the handle.
    pub fn tag(&self) -> String {
        self.key().to_string()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Move to `to`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, to: InstanceState, now: DateTime<Utc>) -> Result<(), ModelError> {
        if !self.state.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now.trunc_subsecs(3);
        Ok(())
    }

    /// Record acceptance by the resource manager.
    pub fn mark_submitted(
        &mut self,
        handle: JobHandle,
        artifact_path: PathBuf,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        self.transition(InstanceState::Submitted, now)?;
        self.external_handle = Some(handle);
        self.artifact_path = Some(artifact_path);
        Ok(())
    }

    /// Move to a terminal failure state with a diagnostic.
    pub fn fail(
        &mut self,
        to: InstanceState,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        self.transition(to, now)?;
        self.last_error = Some(error.into());
        Ok(())
    }
}
