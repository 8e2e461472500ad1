//! Metrics sink adapter.
//!
//! Results leave the agent through a single `write` capability. Delivery
//! failures are logged and never escalate: by the time a result reaches the
//! sink its outcome is already durable in the state store.

mod influx;
mod memory;

pub use influx::{InfluxConfig, InfluxSink};
pub use memory::MemorySink;

use std::sync::Arc;

use async_trait::async_trait;
use sitemon_model::ProbeResult;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from sink writes.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid sink configuration: {0}")]
    Config(String),
}

/// An external store receiving probe results.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Write one result, timestamped at its `finished_at`.
    async fn write(&self, result: &ProbeResult) -> Result<(), SinkError>;
}

/// Front door to an optional sink.
#[derive(Clone)]
pub struct ResultReporter {
    sink: Option<Arc<dyn MetricsSink>>,
}

impl ResultReporter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A reporter that only logs results.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Hand a result to the sink. Returns true if the sink accepted it.
    pub async fn report(&self, result: &ProbeResult) -> bool {
        let Some(sink) = &self.sink else {
            info!(
                probe = %result.probe_name,
                site = %result.site,
                passed = result.overall_passed,
                summary = %result.summary(),
                "Result not forwarded, metrics sink disabled"
            );
            return false;
        };

        match sink.write(result).await {
            Ok(()) => {
                info!(
                    probe = %result.probe_name,
                    passed = result.overall_passed,
                    "Result written to metrics sink"
                );
                true
            }
            Err(e) => {
                warn!(
                    probe = %result.probe_name,
                    error = %e,
                    "Failed to write result to metrics sink"
                );
                false
            }
        }
    }
}
