//! sitemon agent
//!
//! Runs configured probes on a batch resource manager and reports their
//! results. See the library documentation for the architecture.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sitemon_agent::config::{self, Args, GatewayKind, LogFormat, ProbeLayout};
use sitemon_agent::gateway::{CondorConfig, CondorGateway, MockGateway, SubmissionGateway};
use sitemon_agent::scheduler::{Scheduler, SchedulerConfig};
use sitemon_agent::sink::{InfluxSink, ResultReporter};
use sitemon_agent::state::StateStore;
use sitemon_agent::tracker::{LifecycleTracker, TrackerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting sitemon agent");

    // Load configuration
    let layout = ProbeLayout::new(&args.configdir, &args.workdir);
    let config_file = args.config_file();
    let probes = config::load_probes(&config_file, &layout)
        .with_context(|| format!("loading probe definitions from {}", config_file.display()))?;

    let influx = if args.no_influxdb {
        None
    } else {
        let path = args.influxdb_config_file();
        Some(
            config::load_influx_config(&path)
                .with_context(|| format!("loading InfluxDB parameters from {}", path.display()))?,
        )
    };

    let enabled: Vec<&str> = probes
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.name.as_str())
        .collect();
    info!(
        config_file = %config_file.display(),
        probes = probes.len(),
        enabled = ?enabled,
        influxdb = influx.is_some(),
        "Configuration loaded"
    );

    if args.check {
        info!("Configuration check passed");
        return Ok(());
    }

    std::fs::create_dir_all(&args.workdir)
        .with_context(|| format!("creating {}", args.workdir.display()))?;
    let db_file = args.job_db_file();
    let store = Arc::new(
        StateStore::open(&db_file)
            .with_context(|| format!("opening job database {}", db_file.display()))?,
    );

    let gateway: Arc<dyn SubmissionGateway> = match args.gateway {
        GatewayKind::Condor => Arc::new(CondorGateway::new(CondorConfig {
            submit_dir: args.workdir.join("submit"),
            accounting_group: Some(args.accounting_group.clone()),
            schedd_name: args.schedd.clone(),
            bin_dir: None,
        })),
        GatewayKind::Mock => {
            warn!("Using simulated resource manager, no jobs will run");
            Arc::new(MockGateway::simulated())
        }
    };

    let reporter = match influx {
        Some(influx) => {
            let sink = InfluxSink::new(influx, hostname()).context("creating InfluxDB client")?;
            ResultReporter::new(Arc::new(sink))
        }
        None => {
            info!("InfluxDB disabled, results will only be logged");
            ResultReporter::disabled()
        }
    };

    let tracker = Arc::new(LifecycleTracker::new(
        gateway,
        Arc::clone(&store),
        reporter,
        TrackerConfig {
            query_timeout: args.query_timeout(),
            submit_timeout: args.query_timeout(),
            cleanup_on_pass: true,
        },
    ));

    // Resume whatever the previous run left behind
    tracker
        .recover(&probes, Utc::now())
        .await
        .context("recovering job state")?;

    let scheduler = Scheduler::new(
        tracker,
        store,
        probes,
        SchedulerConfig {
            tick: args.tick(),
            history_retention: chrono::Duration::days(args.history_retention_days),
            prune_interval: Duration::from_secs(3600),
        },
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            if let Err(e) = scheduler_handle.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(()) => info!("Scheduler exited"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
    }

    info!("sitemon agent shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Name of this host, attached to every reported result.
fn hostname() -> String {
    std::fs::read_to_string(Path::new("/proc/sys/kernel/hostname"))
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
