//! In-memory sink for tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use sitemon_model::ProbeResult;

use super::{MetricsSink, SinkError};

/// Records every accepted result.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<ProbeResult>>,
    fail: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every write.
    pub fn failing() -> Self {
        let sink = Self::new();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProbeResult>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accepted results, in write order.
    pub fn results(&self) -> Vec<ProbeResult> {
        self.lock().clone()
    }

    pub fn results_for(&self, probe_name: &str) -> Vec<ProbeResult> {
        self.lock()
            .iter()
            .filter(|r| r.probe_name == probe_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn write(&self, result: &ProbeResult) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                status: 503,
                body: "memory sink configured to fail".to_string(),
            });
        }
        self.lock().push(result.clone());
        Ok(())
    }
}
