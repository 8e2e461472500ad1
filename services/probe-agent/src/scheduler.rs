//! Scheduler loop.
//!
//! On every tick each configured probe is either started (enabled, due, and
//! no active instance) or polled (active instance). Probes are driven
//! concurrently within a tick and a failure in one never reaches another.
//! Instances of probes that are disabled or no longer configured keep being
//! polled until they terminate.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sitemon_model::ProbeDefinition;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state::StateStore;
use crate::tracker::{LifecycleTracker, Step, TrackerError};

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the control loop; much finer than any probe interval.
    pub tick: Duration,

    /// How long terminal instances are kept in the store.
    pub history_retention: chrono::Duration,

    /// Interval between history pruning passes.
    pub prune_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            history_retention: chrono::Duration::days(7),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

/// Counts of what happened during one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// New instances created.
    pub started: usize,
    /// Active instances polled.
    pub polled: usize,
    /// Instances that reached a terminal state.
    pub finished: usize,
    /// Probes skipped because their slot was held.
    pub deferred: usize,
    /// Probes whose step failed.
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, step: &Result<Step, TrackerError>) {
        match step {
            Ok(Step::Busy) => self.deferred += 1,
            Ok(Step::Idle) => {}
            Ok(Step::Started(_)) => self.started += 1,
            Ok(Step::Advanced(_)) => self.polled += 1,
            Err(_) => self.errors += 1,
        }
        if matches!(step, Ok(s) if s.is_terminal()) {
            self.finished += 1;
        }
    }
}

/// Returns true if `probe` may be submitted at `now`.
pub fn is_due(probe: &ProbeDefinition, last_submitted_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    probe.enabled
        && last_submitted_at.map_or(true, |last| now - last >= probe.interval())
}

/// Top-level control loop over a snapshot of probe definitions.
pub struct Scheduler {
    tracker: Arc<LifecycleTracker>,
    store: Arc<StateStore>,
    probes: Vec<ProbeDefinition>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        tracker: Arc<LifecycleTracker>,
        store: Arc<StateStore>,
        probes: Vec<ProbeDefinition>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tracker,
            store,
            probes,
            config,
        }
    }

    pub fn probes(&self) -> &[ProbeDefinition] {
        &self.probes
    }

    /// Run one scheduling pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut names: BTreeSet<String> = self.probes.iter().map(|p| p.name.clone()).collect();
        names.extend(self.tracker.slot_names());

        let steps = join_all(names.iter().map(|name| async move {
            let probe = self.probes.iter().find(|p| &p.name == name);
            (name, self.drive(name, probe, now).await)
        }))
        .await;

        let mut report = TickReport::default();
        for (name, step) in &steps {
            if let Err(e) = step {
                error!(probe = %name, error = %e, "Probe step failed");
            }
            report.record(step);
        }

        debug!(
            started = report.started,
            polled = report.polled,
            finished = report.finished,
            deferred = report.deferred,
            errors = report.errors,
            "Tick complete"
        );
        report
    }

    async fn drive(
        &self,
        name: &str,
        probe: Option<&ProbeDefinition>,
        now: DateTime<Utc>,
    ) -> Result<Step, TrackerError> {
        let Some(mut token) = self.tracker.claim(name)? else {
            return Ok(Step::Busy);
        };

        if token.active().is_some() {
            return self.tracker.advance(&mut token, probe, now).await;
        }

        match probe {
            Some(probe) if is_due(probe, token.last_submitted_at(), now) => {
                self.tracker.start(&mut token, probe, now).await
            }
            _ => Ok(Step::Idle),
        }
    }

    /// Delete history older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>) {
        match self.store.prune_history(now - self.config.history_retention) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Pruned instance history"),
            Err(e) => warn!(error = %e, "Failed to prune instance history"),
        }
    }

    /// Run the loop until shutdown.
    ///
    /// A tick in progress is always completed; shutdown is observed between
    /// ticks and leaves every instance in its last persisted state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick.as_secs(),
            probes = self.probes.len(),
            enabled = self.probes.iter().filter(|p| p.enabled).count(),
            "Starting scheduler loop"
        );

        let mut tick_timer = tokio::time::interval(self.config.tick);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune_timer = tokio::time::interval(self.config.prune_interval);
        prune_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report.errors > 0 {
                        warn!(errors = report.errors, "Tick finished with isolated failures");
                    }
                }
                _ = prune_timer.tick() => {
                    self.prune(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::gateway::MockGateway;
    use crate::sink::ResultReporter;
    use crate::testing::probe;
    use crate::tracker::TrackerConfig;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduler(gateway: Arc<MockGateway>, probes: Vec<ProbeDefinition>) -> Scheduler {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let tracker = Arc::new(LifecycleTracker::new(
            gateway,
            store.clone(),
            ResultReporter::disabled(),
            TrackerConfig::default(),
        ));
        Scheduler::new(tracker, store, probes, SchedulerConfig::default())
    }

    #[rstest]
    #[case::never_submitted(None, 0, true)]
    #[case::too_early(Some(0), 299, false)]
    #[case::exactly_due(Some(0), 300, true)]
    #[case::late(Some(0), 1000, true)]
    fn test_is_due(#[case] last: Option<i64>, #[case] now: i64, #[case] due: bool) {
        let probe = probe("disk-check", 300, 120);
        assert_eq!(is_due(&probe, last.map(at), at(now)), due);
    }

    #[test]
    fn test_disabled_is_never_due() {
        let mut probe = probe("disk-check", 300, 120);
        probe.enabled = false;
        assert!(!is_due(&probe, None, at(0)));
    }

    #[tokio::test]
    async fn test_first_tick_submits_every_enabled_probe() {
        let gateway = Arc::new(MockGateway::new());
        let mut off = probe("off", 60, 30);
        off.enabled = false;
        let sched = scheduler(
            gateway.clone(),
            vec![probe("a", 60, 30), probe("b", 120, 30), off],
        );

        let report = sched.tick(at(0)).await;
        assert_eq!(report.started, 2);
        assert_eq!(gateway.submission_count(), 2);
        assert!(gateway.submissions().iter().all(|t| !t.starts_with("off@")));
    }

    #[tokio::test]
    async fn test_active_instance_is_polled_not_resubmitted() {
        let gateway = Arc::new(MockGateway::new());
        let sched = scheduler(gateway.clone(), vec![probe("a", 60, 600)]);

        sched.tick(at(0)).await;
        let report = sched.tick(at(60)).await;

        assert_eq!(report.started, 0);
        assert_eq!(report.polled, 1);
        assert_eq!(gateway.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_probe_does_not_block_others() {
        let gateway = Arc::new(MockGateway::new());
        let sched = scheduler(gateway.clone(), vec![probe("a", 60, 30), probe("b", 60, 30)]);
        sched.tick(at(0)).await;

        gateway.fail_queries(Some("collector down"));
        let report = sched.tick(at(10)).await;

        assert_eq!(report.polled, 2);
        assert_eq!(report.finished, 2);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_oversized_timeout_does_not_break_tick() {
        let gateway = Arc::new(MockGateway::new());
        let sched = scheduler(
            gateway.clone(),
            vec![probe("a", 60, 100_000_000_000_000_000), probe("b", 60, 30)],
        );

        let report = sched.tick(at(0)).await;
        assert_eq!(report.started, 2);

        gateway.set_all(crate::gateway::JobStatus::Running);
        let report = sched.tick(at(45)).await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.finished, 1);
    }
}
