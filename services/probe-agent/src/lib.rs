//! sitemon probe agent library
//!
//! The agent periodically submits probe jobs to a batch resource manager,
//! tracks every submitted instance until it completes or times out,
//! validates the result artifact each job leaves behind and forwards the
//! outcome to a metrics sink.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler ── tick ──> LifecycleTracker ──> SubmissionGateway (submit / query / remove)
//!                             │
//!                             ├──> StateStore (checkpoint every transition)
//!                             ├──> validator  (on completion)
//!                             └──> ResultReporter ──> MetricsSink
//! ```
//!
//! ## Modules
//!
//! - `config`: flags, probe definition and credentials files
//! - `gateway`: resource manager interface (HTCondor, mock)
//! - `scheduler`: the control loop
//! - `sink`: metrics sink interface (InfluxDB, in-memory)
//! - `state`: local SQLite state persistence
//! - `tracker`: per-instance state machine and crash recovery
//! - `validator`: result artifact evaluation

pub mod config;
pub mod gateway;
pub mod scheduler;
pub mod sink;
pub mod state;
pub mod tracker;
pub mod validator;

// Fixtures exposed for integration tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use gateway::{CondorGateway, JobStatus, MockGateway, SubmissionGateway};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use sink::{InfluxSink, MemorySink, MetricsSink, ResultReporter};
pub use state::StateStore;
pub use tracker::{LifecycleTracker, Step, TrackerConfig};
