//! Property tests for the scheduling invariants.
//!
//! - at most one non-terminal instance per probe, even when ticks overlap
//! - disabled probes never produce an instance
//! - no probe is submitted twice within one interval window

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use proptest::prelude::*;
use sitemon_agent::gateway::{Completion, JobStatus, MockGateway};
use sitemon_agent::scheduler::{Scheduler, SchedulerConfig};
use sitemon_agent::sink::{MemorySink, ResultReporter};
use sitemon_agent::state::StateStore;
use sitemon_agent::testing::probe_in;
use sitemon_agent::tracker::{LifecycleTracker, TrackerConfig};
use sitemon_model::ProbeDefinition;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn build(gateway: Arc<MockGateway>, probes: Vec<ProbeDefinition>) -> (Arc<StateStore>, Scheduler) {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let tracker = Arc::new(LifecycleTracker::new(
        gateway,
        store.clone(),
        ResultReporter::new(Arc::new(MemorySink::new())),
        TrackerConfig::default(),
    ));
    let scheduler = Scheduler::new(tracker, store.clone(), probes, SchedulerConfig::default());
    (store, scheduler)
}

/// What the mock resource manager does to every job between ticks.
#[derive(Debug, Clone)]
enum Script {
    Nothing,
    Run,
    Finish,
    Vanish,
}

fn script() -> impl Strategy<Value = Script> {
    prop_oneof![
        3 => Just(Script::Nothing),
        3 => Just(Script::Run),
        2 => Just(Script::Finish),
        1 => Just(Script::Vanish),
    ]
}

fn apply(gateway: &MockGateway, script: &Script) {
    match script {
        Script::Nothing => {}
        Script::Run => gateway.set_all(JobStatus::Running),
        Script::Finish => gateway.set_all(JobStatus::Completed(Completion::succeeded())),
        Script::Vanish => {
            for handle in gateway.handles() {
                gateway.forget(&handle);
            }
        }
    }
}

fn probes_strategy() -> impl Strategy<Value = Vec<(u64, u64, bool)>> {
    prop::collection::vec((10u64..300, 5u64..600, any::<bool>()), 1..5)
}

fn make_probes(root: &std::path::Path, specs: &[(u64, u64, bool)]) -> Vec<ProbeDefinition> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (interval, timeout, enabled))| {
            let mut probe = probe_in(root, &format!("p{i}"), *interval, *timeout);
            probe.enabled = *enabled;
            probe
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: overlapping ticks never leave two active instances of a probe.
    #[test]
    fn prop_at_most_one_active_instance(
        specs in probes_strategy(),
        steps in prop::collection::vec((1i64..120, 1usize..4, script()), 1..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let probes = make_probes(dir.path(), &specs);
        let names: Vec<String> = probes.iter().map(|p| p.name.clone()).collect();

        let max_active = runtime().block_on(async {
            let gateway = Arc::new(MockGateway::new());
            gateway.set_submit_delay(Some(Duration::from_millis(5)));
            gateway.set_query_delay(Some(Duration::from_millis(3)));
            let (store, scheduler) = build(gateway.clone(), probes);

            let mut now = 0;
            let mut max_active = 0;
            for (advance, concurrency, script) in &steps {
                now += advance;
                join_all((0..*concurrency).map(|_| scheduler.tick(at(now)))).await;
                for name in &names {
                    max_active = max_active.max(store.active_count(name).unwrap());
                }
                apply(&gateway, script);
            }
            max_active
        });

        prop_assert!(max_active <= 1, "observed {} active instances", max_active);
    }

    /// Property: disabled probes are never submitted.
    #[test]
    fn prop_disabled_probes_never_create_instances(
        specs in probes_strategy(),
        ticks in prop::collection::vec(1i64..200, 1..30),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let probes = make_probes(dir.path(), &specs);
        let disabled: Vec<String> = probes
            .iter()
            .filter(|p| !p.enabled)
            .map(|p| p.name.clone())
            .collect();

        let (submissions, history) = runtime().block_on(async {
            let gateway = Arc::new(MockGateway::new());
            let (store, scheduler) = build(gateway.clone(), probes);

            let mut now = 0;
            for advance in &ticks {
                now += advance;
                scheduler.tick(at(now)).await;
                gateway.set_all(JobStatus::Completed(Completion::succeeded()));
            }

            let history: usize = disabled
                .iter()
                .map(|name| store.history(name, 1000).unwrap().len())
                .sum();
            (gateway.submissions(), history)
        });

        for name in &disabled {
            let prefix = format!("{name}@");
            prop_assert!(!submissions.iter().any(|t| t.starts_with(&prefix)));
        }
        prop_assert_eq!(history, 0);
    }

    /// Property: over ten times the shortest interval, no probe is submitted
    /// twice within one of its intervals.
    #[test]
    fn prop_submissions_respect_interval(
        intervals in prop::collection::btree_set(20u64..200, 1..5),
        tick in 1i64..30,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let probes: Vec<ProbeDefinition> = intervals
            .iter()
            .enumerate()
            .map(|(i, interval)| probe_in(dir.path(), &format!("p{i}"), *interval, interval / 2 + 1))
            .collect();
        let shortest = *intervals.iter().next().unwrap() as i64;
        let horizon = shortest * 10;

        let submitted = runtime().block_on(async {
            let gateway = Arc::new(MockGateway::simulated());
            let (store, scheduler) = build(gateway.clone(), probes.clone());

            let mut now = 0;
            while now <= horizon {
                scheduler.tick(at(now)).await;
                now += tick;
            }

            probes
                .iter()
                .map(|p| {
                    let mut times: Vec<DateTime<Utc>> = store
                        .history(&p.name, 10_000)
                        .unwrap()
                        .into_iter()
                        .map(|e| e.instance.submitted_at)
                        .collect();
                    times.sort();
                    (p.name.clone(), (p.interval(), times))
                })
                .collect::<HashMap<_, _>>()
        });

        for (name, (interval, times)) in &submitted {
            prop_assert!(!times.is_empty(), "{} never submitted", name);
            for pair in times.windows(2) {
                prop_assert!(
                    pair[1] - pair[0] >= *interval,
                    "{} submitted at {} and {}", name, pair[0], pair[1]
                );
            }
            let windows = horizon / interval.num_seconds() + 1;
            prop_assert!(times.len() as i64 <= windows);
        }
    }
}
