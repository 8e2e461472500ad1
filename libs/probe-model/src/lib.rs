//! # sitemon-model
//!
//! Record types shared by the sitemon probe agent.
//!
//! ## Types
//!
//! - [`ProbeDefinition`]: an immutable, periodically executed probe loaded
//!   from configuration, carrying the opaque [`JobSpec`] handed to the
//!   resource manager.
//! - [`JobInstance`]: one concrete submission of a probe and its lifecycle
//!   [`InstanceState`].
//! - [`TestResult`] / [`ProbeResult`]: the parsed result artifact and the
//!   aggregate outcome reported downstream.
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING -> SUBMITTED -> RUNNING -> COMPLETED
//!    |           |           |
//!    |           +-----------+----> TIMED_OUT
//!    +--> SUBMIT_FAILED      +----> INFRA_ERROR (from any non-terminal state)
//! ```
//!
//! Terminal states are final. A terminated instance is superseded by a fresh
//! `PENDING` instance at the probe's next eligible tick.

mod artifact;
mod error;
mod failure;
mod instance;
mod probe;
mod result;

pub use artifact::parse_artifact;
pub use error::{ArtifactError, ModelError};
pub use failure::ProbeFailure;
pub use instance::{InstanceKey, InstanceState, JobInstance};
pub use probe::{
    JobHandle, JobSpec, ProbeDefinition, ResourceRequest, HANDLE_PLACEHOLDER, MAX_PERIOD_SECS,
};
pub use result::{ProbeResult, TestResult};
