//! Local state persistence for the probe agent.
//!
//! This module provides SQLite-based storage for job instances:
//! - Active instances (resumed after a restart instead of resubmitted)
//! - Terminal instances with their reported outcome (bounded history)
//!
//! Every lifecycle transition is written here before anything is sent to the
//! metrics sink.

mod store;

pub use store::{HistoryEntry, StateStore, StateStoreError};
