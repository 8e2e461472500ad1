//! Configuration for the probe agent.
//!
//! Process settings come from flags with `SITEMON_*` environment fallbacks.
//! Probe definitions and sink credentials come from YAML files in the
//! configuration directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use sitemon_model::{
    JobSpec, ProbeDefinition, ResourceRequest, HANDLE_PLACEHOLDER, MAX_PERIOD_SECS,
};
use thiserror::Error;
use tracing::warn;

use crate::sink::InfluxConfig;

/// Errors from loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid probe configuration: {0}")]
    Invalid(String),
}

/// Resource manager backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GatewayKind {
    /// HTCondor command-line tools.
    Condor,
    /// In-process simulation; nothing leaves the host.
    Mock,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// sitemon agent - periodic resource availability probes.
#[derive(Debug, Clone, Parser)]
#[command(name = "sitemon-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding probe definitions and per-probe executables.
    #[arg(long, env = "SITEMON_CONFIGDIR", default_value = "job_configuration")]
    pub configdir: PathBuf,

    /// Directory receiving logs, results and the job database.
    #[arg(long, env = "SITEMON_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,

    /// Probe definition file [default: <configdir>/config.yml].
    #[arg(long, env = "SITEMON_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// InfluxDB credentials file [default: <configdir>/influx_parameters.yml].
    #[arg(long, env = "SITEMON_INFLUXDB_CONFIG_FILE")]
    pub influxdb_config_file: Option<PathBuf>,

    /// Job state database [default: <workdir>/jobs.sqlite3].
    #[arg(long, env = "SITEMON_JOB_DB_FILE")]
    pub job_db_file: Option<PathBuf>,

    /// Validate configuration and exit.
    #[arg(long)]
    pub check: bool,

    /// Log results instead of writing them to InfluxDB.
    #[arg(long, env = "SITEMON_NO_INFLUXDB")]
    pub no_influxdb: bool,

    /// Resource manager backend.
    #[arg(long, value_enum, env = "SITEMON_GATEWAY", default_value_t = GatewayKind::Condor)]
    pub gateway: GatewayKind,

    /// Remote schedd to submit to.
    #[arg(long, env = "SITEMON_SCHEDD")]
    pub schedd: Option<String>,

    /// Accounting group charged for probe jobs.
    #[arg(long, env = "SITEMON_ACCOUNTING_GROUP", default_value = "sitetest")]
    pub accounting_group: String,

    /// Seconds between scheduler ticks.
    #[arg(long, env = "SITEMON_TICK_SECS", default_value_t = 10)]
    pub tick_secs: u64,

    /// Seconds before a resource manager call is abandoned.
    #[arg(long, env = "SITEMON_QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Days of finished instances kept in the job database.
    #[arg(long, env = "SITEMON_HISTORY_RETENTION_DAYS", default_value_t = 7)]
    pub history_retention_days: i64,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "SITEMON_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, env = "SITEMON_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Args {
    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.configdir.join("config.yml"))
    }

    pub fn influxdb_config_file(&self) -> PathBuf {
        self.influxdb_config_file
            .clone()
            .unwrap_or_else(|| self.configdir.join("influx_parameters.yml"))
    }

    pub fn job_db_file(&self) -> PathBuf {
        self.job_db_file
            .clone()
            .unwrap_or_else(|| self.workdir.join("jobs.sqlite3"))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFile {
    jobs: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    name: String,
    parameters: JobParameters,
}

#[derive(Debug, Deserialize)]
struct JobParameters {
    #[serde(default = "default_enabled")]
    enabled: bool,
    interval: u64,
    timeout: u64,
    site: String,
    job: JobSection,
    requirements: RequirementsSection,
}

#[derive(Debug, Deserialize)]
struct JobSection {
    executable: String,
    #[serde(default)]
    arguments: String,
    #[serde(default = "default_universe")]
    universe: String,
    output_file: String,
    output: String,
    error: String,
    log: String,
    #[serde(default)]
    input_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RequirementsSection {
    cpu: u32,
    memory: serde_yaml::Value,
    disk: serde_yaml::Value,
    #[serde(default)]
    gpu: u32,
    #[serde(default)]
    requirements: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_universe() -> String {
    "vanilla".to_string()
}

/// Render a size given either as a number or a string with units.
fn size_string(value: &serde_yaml::Value) -> Result<String, String> {
    match value {
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        other => Err(format!("expected a size, got {other:?}")),
    }
}

/// Locations the agent derives probe paths from.
#[derive(Debug, Clone)]
pub struct ProbeLayout {
    /// Per-probe executables live in `<configdir>/<name>/`.
    pub configdir: PathBuf,
    /// Logs and results live below `<workdir>`.
    pub workdir: PathBuf,
}

impl ProbeLayout {
    pub fn new(configdir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            configdir: configdir.into(),
            workdir: workdir.into(),
        }
    }

    pub fn logs_dir(&self, probe: &str) -> PathBuf {
        self.workdir.join("logs").join(probe)
    }

    pub fn results_dir(&self, probe: &str) -> PathBuf {
        self.workdir.join("results").join(probe)
    }

    fn resolve(&self, probe: &str, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.configdir.join(probe).join(path)
        }
    }

    fn build(&self, entry: JobEntry) -> Result<ProbeDefinition, String> {
        let name = entry.name.trim().to_string();
        let params = entry.parameters;
        let job = params.job;
        let logs = self.logs_dir(&name);

        let resources = ResourceRequest {
            cpus: params.requirements.cpu,
            memory: size_string(&params.requirements.memory)
                .map_err(|e| format!("job {name}: memory: {e}"))?,
            disk: size_string(&params.requirements.disk)
                .map_err(|e| format!("job {name}: disk: {e}"))?,
            gpus: params.requirements.gpu,
            requirements: params.requirements.requirements.filter(|r| !r.trim().is_empty()),
        };

        Ok(ProbeDefinition {
            enabled: params.enabled,
            site: params.site,
            interval_secs: params.interval,
            timeout_secs: params.timeout,
            job: JobSpec {
                executable: self.resolve(&name, &job.executable),
                arguments: job.arguments,
                universe: job.universe,
                input_files: job
                    .input_files
                    .iter()
                    .map(|f| self.resolve(&name, f))
                    .collect(),
                stdout: logs.join(format!("{HANDLE_PLACEHOLDER}_{}", job.output)),
                stderr: logs.join(format!("{HANDLE_PLACEHOLDER}_{}", job.error)),
                log: logs.join(&job.log),
                result_file: self
                    .results_dir(&name)
                    .join(format!("id_{HANDLE_PLACEHOLDER}-0-{}", job.output_file)),
                output_file: job.output_file,
                resources,
            },
            name,
        })
    }
}

/// Parse and validate a probe definition document.
pub fn parse_probes(text: &str, layout: &ProbeLayout) -> Result<Vec<ProbeDefinition>, ConfigError> {
    let file: ProbeFile = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
        path: PathBuf::from("<probe definitions>"),
        source,
    })?;

    let probes = file
        .jobs
        .into_iter()
        .map(|entry| layout.build(entry))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ConfigError::Invalid)?;

    validate(&probes)?;
    Ok(probes)
}

/// Load probe definitions from `path`.
pub fn load_probes(path: &Path, layout: &ProbeLayout) -> Result<Vec<ProbeDefinition>, ConfigError> {
    let text = read(path)?;
    parse_probes(&text, layout).map_err(|e| match e {
        ConfigError::Yaml { source, .. } => ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Load sink credentials from `path`.
pub fn load_influx_config(path: &Path) -> Result<InfluxConfig, ConfigError> {
    let text = read(path)?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn validate(probes: &[ProbeDefinition]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for probe in probes {
        if probe.name.is_empty() {
            return Err(ConfigError::Invalid("job with an empty name".to_string()));
        }
        if !seen.insert(probe.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate job name {}", probe.name)));
        }
        if probe.interval_secs == 0 {
            return Err(ConfigError::Invalid(format!("job {}: interval must be > 0", probe.name)));
        }
        if probe.timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!("job {}: timeout must be > 0", probe.name)));
        }
        if probe.interval_secs > MAX_PERIOD_SECS || probe.timeout_secs > MAX_PERIOD_SECS {
            return Err(ConfigError::Invalid(format!(
                "job {}: interval and timeout must not exceed {MAX_PERIOD_SECS}s",
                probe.name
            )));
        }
        if probe.may_overlap() {
            warn!(
                probe = %probe.name,
                interval_secs = probe.interval_secs,
                timeout_secs = probe.timeout_secs,
                "Timeout exceeds interval; submissions will be deferred while an instance runs"
            );
        }
    }

    if !probes.iter().any(|p| p.enabled) {
        return Err(ConfigError::Invalid("no enabled jobs".to_string()));
    }
    Ok(())
}
