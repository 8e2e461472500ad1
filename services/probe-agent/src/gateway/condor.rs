//! HTCondor gateway driven through the HTCondor command-line tools.
//!
//! - `condor_submit -terse` submits and prints the cluster id (the handle)
//! - `condor_q` / `condor_history` with `-af` report status and accounting
//! - `condor_rm` removes a cluster
//!
//! Each submission carries a `SitemonInstance` job attribute holding the
//! instance tag, which `lookup` uses to find jobs whose handle was lost.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sitemon_model::{JobHandle, JobSpec, HANDLE_PLACEHOLDER};
use tokio::process::Command;
use tracing::{debug, info};

use super::{Completion, GatewayError, JobStatus, SubmissionGateway};

/// Job attribute carrying the instance tag.
const TAG_ATTRIBUTE: &str = "SitemonInstance";

/// Attributes projected by status queries, in column order.
const STATUS_ATTRIBUTES: [&str; 5] = [
    "JobStatus",
    "ExitCode",
    "RemoteWallClockTime",
    "RemoteUserCpu",
    "RemoteSysCpu",
];

/// HTCondor gateway configuration.
#[derive(Debug, Clone)]
pub struct CondorConfig {
    /// Directory receiving generated submit description files.
    pub submit_dir: PathBuf,
    /// Accounting group charged for probe jobs.
    pub accounting_group: Option<String>,
    /// Remote schedd to talk to instead of the local one.
    pub schedd_name: Option<String>,
    /// Directory holding the HTCondor binaries, if not on `PATH`.
    pub bin_dir: Option<PathBuf>,
}

impl CondorConfig {
    pub fn new(submit_dir: impl Into<PathBuf>) -> Self {
        Self {
            submit_dir: submit_dir.into(),
            accounting_group: Some("sitetest".to_string()),
            schedd_name: None,
            bin_dir: None,
        }
    }
}

/// Gateway to an HTCondor schedd.
pub struct CondorGateway {
    config: CondorConfig,
}

impl CondorGateway {
    pub fn new(config: CondorConfig) -> Self {
        Self { config }
    }

    fn command(&self, program: &str) -> Command {
        let program = match &self.config.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let mut cmd = Command::new(program);
        if let Some(name) = &self.config.schedd_name {
            cmd.arg("-name").arg(name);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, GatewayError> {
        let mut cmd = self.command(program);
        cmd.args(args);
        debug!(program, ?args, "Running HTCondor command");

        let out = cmd
            .output()
            .await
            .map_err(|e| GatewayError::Unreachable(format!("{program}: {e}")))?;
        if !out.status.success() {
            return Err(GatewayError::Rejected(format!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn query_ads(&self, program: &str, cluster: &str) -> Result<Option<String>, GatewayError> {
        let mut args = vec![cluster];
        if program == "condor_history" {
            args.extend(["-limit", "1"]);
        }
        args.push("-af");
        args.extend(STATUS_ATTRIBUTES);

        let body = self.run(program, &args).await?;
        Ok(body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn find_cluster(&self, program: &str, tag: &str) -> Result<Option<JobHandle>, GatewayError> {
        let constraint = format!("{TAG_ATTRIBUTE} == \"{}\"", escape(tag));
        let mut args = vec!["-constraint", constraint.as_str()];
        if program == "condor_history" {
            args.extend(["-limit", "1"]);
        }
        args.extend(["-af", "ClusterId"]);

        let body = self.run(program, &args).await?;
        Ok(body
            .split_whitespace()
            .next()
            .map(|cluster| JobHandle::new(cluster)))
    }
}

#[async_trait]
impl SubmissionGateway for CondorGateway {
    async fn submit(&self, spec: &JobSpec, tag: &str) -> Result<JobHandle, GatewayError> {
        for path in [&spec.stdout, &spec.stderr, &spec.log, &spec.result_file] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::create_dir_all(&self.config.submit_dir).await?;

        let description = submit_description(spec, tag, self.config.accounting_group.as_deref());
        let submit_file = self
            .config
            .submit_dir
            .join(format!("{}.sub", tag.replace(['/', ' '], "_")));
        tokio::fs::write(&submit_file, description).await?;

        let submit_arg = submit_file.to_string_lossy().into_owned();
        let body = self.run("condor_submit", &["-terse", &submit_arg]).await?;
        let handle = parse_terse_submit(&body)?;

        info!(tag = %tag, handle = %handle, "Submitted job to HTCondor");
        Ok(handle)
    }

    async fn query(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError> {
        if let Some(line) = self.query_ads("condor_q", handle.as_str()).await? {
            return parse_status_line(&line);
        }
        match self.query_ads("condor_history", handle.as_str()).await? {
            Some(line) => parse_status_line(&line),
            None => Ok(JobStatus::NotFound),
        }
    }

    async fn remove(&self, handle: &JobHandle) -> Result<(), GatewayError> {
        self.run("condor_rm", &[handle.as_str()]).await?;
        info!(handle = %handle, "Removed HTCondor job");
        Ok(())
    }

    async fn lookup(&self, tag: &str) -> Result<Option<JobHandle>, GatewayError> {
        if let Some(handle) = self.find_cluster("condor_q", tag).await? {
            return Ok(Some(handle));
        }
        self.find_cluster("condor_history", tag).await
    }
}

/// Render the submit description for one instance.
fn submit_description(spec: &JobSpec, tag: &str, accounting_group: Option<&str>) -> String {
    let cluster_path = |p: &Path| p.to_string_lossy().replace(HANDLE_PLACEHOLDER, "$(Cluster)");

    let mut lines = vec![
        format!("executable = {}", spec.executable.display()),
        format!("universe = {}", spec.universe),
        "should_transfer_files = YES".to_string(),
        "when_to_transfer_output = ON_EXIT_OR_EVICT".to_string(),
        format!("transfer_output_files = {}", spec.output_file),
        format!(
            "transfer_output_remaps = \"{} = {}\"",
            spec.output_file,
            cluster_path(&spec.result_file)
        ),
        format!("output = {}", cluster_path(&spec.stdout)),
        format!("error = {}", cluster_path(&spec.stderr)),
        format!("log = {}", cluster_path(&spec.log)),
        format!("request_cpus = {}", spec.resources.cpus),
        format!("request_memory = {}", spec.resources.memory),
        format!("request_disk = {}", spec.resources.disk),
        format!("request_gpus = {}", spec.resources.gpus),
        format!("+{TAG_ATTRIBUTE} = \"{}\"", escape(tag)),
    ];
    if !spec.arguments.is_empty() {
        lines.push(format!("arguments = {}", spec.arguments));
    }
    if !spec.input_files.is_empty() {
        let inputs: Vec<String> = spec
            .input_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        lines.push(format!("transfer_input_files = {}", inputs.join(",")));
    }
    if let Some(requirements) = &spec.resources.requirements {
        lines.push(format!("requirements = {requirements}"));
    }
    if let Some(group) = accounting_group {
        lines.push(format!("accounting_group = {group}"));
    }
    lines.push("queue 1".to_string());

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `condor_submit -terse` prints `first.proc - last.proc`.
fn parse_terse_submit(body: &str) -> Result<JobHandle, GatewayError> {
    let cluster = body
        .split_whitespace()
        .next()
        .and_then(|first| first.split('.').next())
        .filter(|c| !c.is_empty() && c.chars().all(|ch| ch.is_ascii_digit()))
        .ok_or_else(|| GatewayError::Protocol(format!("unparseable submit output: {body:?}")))?;
    Ok(JobHandle::new(cluster))
}

/// Interpret one `-af` line of [`STATUS_ATTRIBUTES`].
fn parse_status_line(line: &str) -> Result<JobStatus, GatewayError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let number = |idx: usize| -> Option<f64> { fields.get(idx).and_then(|v| v.parse().ok()) };

    let job_status = fields
        .first()
        .and_then(|v| v.parse::<u8>().ok())
        .ok_or_else(|| GatewayError::Protocol(format!("missing JobStatus in {line:?}")))?;

    let status = match job_status {
        // Idle, suspended
        1 | 7 => JobStatus::Queued,
        // Running, transferring output
        2 | 6 => JobStatus::Running,
        3 => JobStatus::Completed(Completion::failed("job was removed")),
        5 => JobStatus::Completed(Completion::failed("job was held")),
        4 => {
            let exit_code = number(1).map(|c| c as i64);
            let mut completion = match exit_code {
                Some(0) => Completion::succeeded(),
                Some(code) => Completion::failed(format!("exit code {code}")),
                None => Completion::failed("terminated without an exit code"),
            };
            completion.wall_clock_secs = number(2);
            completion.cpu_efficiency = match (number(2), number(3), number(4)) {
                (Some(wall), Some(user), Some(sys)) if wall > 0.0 => Some((user + sys) / wall),
                (Some(_), Some(_), Some(_)) => Some(0.0),
                _ => None,
            };
            JobStatus::Completed(completion)
        }
        other => {
            return Err(GatewayError::Protocol(format!(
                "unknown JobStatus {other}"
            )))
        }
    };
    Ok(status)
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
