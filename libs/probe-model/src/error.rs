//! Error types for instance transitions and result artifacts.

use thiserror::Error;

use crate::instance::InstanceState;

/// Errors raised by the record model itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The requested state change is not an edge of the lifecycle graph.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    /// A persisted state string could not be parsed.
    #[error("unknown instance state: {0}")]
    UnknownState(String),
}

/// Errors produced while reading or validating a result artifact.
///
/// These never abort the engine; they become the `failure_reason` of a
/// failing [`crate::ProbeResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// The job did not leave an artifact at the declared path.
    #[error("result file {path} not found")]
    Missing { path: String },

    /// The artifact exists but could not be read.
    #[error("could not read result file {path}: {message}")]
    Unreadable { path: String, message: String },

    /// The artifact is not a document with a `tests` sequence of valid records.
    #[error("malformed result document: {0}")]
    Malformed(String),

    /// A test record has an empty identifier.
    #[error("test entry {index} has an empty name")]
    EmptyTestName { index: usize },

    /// The artifact parsed but contains no test records.
    #[error("result document contains no test entries")]
    NoTests,
}

impl ArtifactError {
    /// Returns true if the artifact was never produced.
    pub fn is_missing(&self) -> bool {
        matches!(self, ArtifactError::Missing { .. })
    }
}
