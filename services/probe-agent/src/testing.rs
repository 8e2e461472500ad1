//! Fixtures shared by unit and integration tests.

use std::path::{Path, PathBuf};

use sitemon_model::{JobSpec, ProbeDefinition, ResourceRequest};

/// A probe whose files live under `/var/lib/sitemon`.
pub fn probe(name: &str, interval_secs: u64, timeout_secs: u64) -> ProbeDefinition {
    probe_in(Path::new("/var/lib/sitemon"), name, interval_secs, timeout_secs)
}

/// A probe whose logs and results live under `root`.
pub fn probe_in(root: &Path, name: &str, interval_secs: u64, timeout_secs: u64) -> ProbeDefinition {
    let logs = root.join("logs").join(name);
    ProbeDefinition {
        name: name.to_string(),
        enabled: true,
        site: "site-a".to_string(),
        interval_secs,
        timeout_secs,
        job: JobSpec {
            executable: PathBuf::from(format!("/etc/sitemon/{name}/run.sh")),
            arguments: String::new(),
            universe: "vanilla".to_string(),
            input_files: vec![],
            output_file: "result.yml".to_string(),
            stdout: logs.join("{handle}_out.log"),
            stderr: logs.join("{handle}_err.log"),
            log: logs.join("condor.log"),
            result_file: root
                .join("results")
                .join(name)
                .join("id_{handle}-0-result.yml"),
            resources: ResourceRequest {
                cpus: 1,
                memory: "512MB".to_string(),
                disk: "1GB".to_string(),
                gpus: 0,
                requirements: None,
            },
        },
    }
}

/// Write a passing artifact with one record per test name.
pub fn write_passing_artifact(path: &Path, tests: &[&str]) -> std::io::Result<()> {
    write_artifact(path, &tests.iter().map(|t| (*t, true)).collect::<Vec<_>>())
}

/// Write an artifact with the given verdicts.
pub fn write_artifact(path: &Path, tests: &[(&str, bool)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = String::from("tests:\n");
    for (name, passed) in tests {
        body.push_str(&format!(
            "  - name: {name}\n    passed: {passed}\n    message: \"{name} finished\"\n"
        ));
    }
    std::fs::write(path, body)
}
