//! PBS/Torque adapter.
//!
//! Talks to the scheduler through `qsub`, `qstat`, `qdel` and `pbsnodes`.
//! Open-source Torque and PBS Pro disagree on flags and resource syntax,
//! so the flavour is probed once when the adapter is built.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::batch::adapter::{BatchAdapter, BatchJobId, JobRequest};
use crate::batch::command::CommandRunner;
use crate::config::{TorqueConfig, TorqueFlavor};
use crate::error::{GridflowError, Result};

/// Resource keys the adapter builds itself; overrides may not repeat them.
const RESERVED_RESOURCE_KEYS: [&str; 3] = ["mem=", "nodes=", "ppn="];

pub struct TorqueAdapter {
    runner: Arc<dyn CommandRunner>,
    config: TorqueConfig,
    flavor: TorqueFlavor,
}

impl TorqueAdapter {
    /// Build an adapter, probing the scheduler flavour unless the config forces one.
    pub async fn new(runner: Arc<dyn CommandRunner>, config: TorqueConfig) -> Self {
        let flavor = match config.flavor {
            Some(flavor) => flavor,
            None => detect_flavor(runner.as_ref()).await,
        };
        Self {
            runner,
            config,
            flavor,
        }
    }

    pub fn flavor(&self) -> TorqueFlavor {
        self.flavor
    }

    fn qsub_line(&self, job_id: BatchJobId, request: &JobRequest) -> Result<Vec<String>> {
        let mut line: Vec<String> = ["qsub", "-S", "/bin/sh", "-V", "-N"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        line.push(format!("gridflow_job_{job_id}"));

        if !request.environment.is_empty() {
            let vars = request
                .environment
                .iter()
                .map(|(key, value)| {
                    shlex::try_quote(value)
                        .map(|quoted| format!("{key}={quoted}"))
                        .map_err(|e| {
                            GridflowError::Config(format!("cannot quote value of {key}: {e}"))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            line.push("-v".to_string());
            line.push(vars.join(","));
        }

        let mut reqs = self.resource_requests(request);
        if let Some(extra) = &self.config.extra_reqs {
            check_reserved_keys(extra)?;
            tracing::debug!(reqs = %extra, "Appending additional Torque resource requirements");
            reqs.push(extra.clone());
        }
        if !reqs.is_empty() {
            line.push("-l".to_string());
            line.push(reqs.join(","));
        }

        if let Some(extra) = &self.config.extra_args {
            check_reserved_keys(extra)?;
            tracing::debug!(args = %extra, "Appending native Torque options");
            let args = shlex::split(extra).ok_or_else(|| {
                GridflowError::Config(format!("cannot parse native Torque options: {extra}"))
            })?;
            line.extend(args);
        }

        Ok(line)
    }

    fn resource_requests(&self, request: &JobRequest) -> Vec<String> {
        let cpus = request.cpu.ceil() as u64;
        let gpus = request.gpus.filter(|&g| g > 0);
        let mut reqs = Vec::new();

        match self.flavor {
            TorqueFlavor::Pro => {
                let mut select = "select=1".to_string();
                if request.memory > 0 {
                    select.push_str(&format!(":mem={}K", request.memory / 1024));
                }
                if cpus > 1 {
                    select.push_str(&format!(":ncpus={cpus}"));
                }
                if let Some(gpus) = gpus {
                    select.push_str(&format!(":ngpus={gpus}"));
                }
                reqs.push(select);
            }
            TorqueFlavor::Oss => {
                if request.memory > 0 {
                    reqs.push(format!("mem={}K", request.memory / 1024));
                }
                if cpus > 1 || gpus.is_some() {
                    let mut nodes = "nodes=1".to_string();
                    if cpus > 1 {
                        nodes.push_str(&format!(":ppn={cpus}"));
                    }
                    if let Some(gpus) = gpus {
                        nodes.push_str(&format!(":gpus={gpus}"));
                    }
                    reqs.push(nodes);
                }
            }
        }
        reqs
    }

    /// Write the script qsub runs: output directives, a cd into the
    /// submission directory, then the command.
    fn write_wrapper(&self, job_id: BatchJobId, command: &str, logs_dir: &Path) -> Result<PathBuf> {
        let stdout_path = std_output_path(logs_dir, self.name(), job_id, "out");
        let stderr_path = std_output_path(logs_dir, self.name(), job_id, "err");

        let mut file = tempfile::Builder::new()
            .prefix("torque_wrapper")
            .suffix(".sh")
            .tempfile_in(logs_dir)?;
        write!(
            file,
            "#!/bin/sh\n#PBS -o {}\n#PBS -e {}\ncd $PBS_O_WORKDIR\n\n{}\n",
            stdout_path.display(),
            stderr_path.display(),
            command
        )?;
        let (_, path) = file.keep().map_err(|e| GridflowError::Io(e.error))?;
        Ok(path)
    }

    fn qstat_args(&self) -> Vec<String> {
        let mut args = vec!["qstat".to_string()];
        if self.flavor == TorqueFlavor::Pro {
            args.push("-x".to_string());
        }
        args
    }
}

#[async_trait]
impl BatchAdapter for TorqueAdapter {
    fn name(&self) -> &'static str {
        "torque"
    }

    fn prepare_submission(
        &self,
        job_id: BatchJobId,
        request: &JobRequest,
        logs_dir: &Path,
    ) -> Result<Vec<String>> {
        let mut line = self.qsub_line(job_id, request)?;
        let wrapper = self.write_wrapper(job_id, &request.command, logs_dir)?;
        line.push(wrapper.to_string_lossy().into_owned());
        Ok(line)
    }

    async fn submit_job(&self, argv: &[String]) -> Result<String> {
        let stdout = self
            .runner
            .run(argv)
            .await
            .map_err(|e| GridflowError::Launch(e.to_string()))?;
        let external_id = stdout.trim();
        if external_id.is_empty() {
            return Err(GridflowError::Launch("qsub returned no job id".into()));
        }
        Ok(external_id.to_string())
    }

    async fn get_running_job_ids(
        &self,
        jobs: &HashMap<BatchJobId, String>,
    ) -> Result<HashMap<BatchJobId, f64>> {
        let current: HashMap<String, BatchJobId> = jobs
            .iter()
            .map(|(job_id, external)| (short_job_id(external).to_string(), *job_id))
            .collect();
        if current.is_empty() {
            return Ok(HashMap::new());
        }

        // Ask only about our jobs; a bare qstat lists the whole cluster.
        let mut ids: Vec<&String> = current.keys().collect();
        ids.sort();
        let mut args = self.qstat_args();
        args.extend(ids.into_iter().cloned());

        let stdout = self.runner.run(&args).await?;
        let times = parse_running_walltimes(&stdout, &current);
        tracing::debug!(?times, "Job times from qstat");
        Ok(times)
    }

    async fn get_job_exit_code(&self, external_id: &str) -> Result<Option<i32>> {
        let mut args = self.qstat_args();
        args.push("-f".to_string());
        args.push(short_job_id(external_id).to_string());

        match self.runner.run(&args).await {
            Ok(stdout) => Ok(parse_exit_code(&stdout)),
            Err(e) if e.command_stderr().is_some_and(mentions_unknown_job) => {
                // Some sites make Torque forget finished jobs immediately.
                // Status files on disk decide whether the job really succeeded.
                tracing::debug!(external_id, "Batch system no longer remembers job");
                Ok(Some(0))
            }
            Err(e) => Err(e),
        }
    }

    async fn kill_job(&self, external_id: &str) -> Result<()> {
        let args = vec!["qdel".to_string(), external_id.to_string()];
        self.runner.run(&args).await?;
        Ok(())
    }
}

/// Probe `pbsnodes --version` for the scheduler flavour, defaulting to OSS.
pub async fn detect_flavor(runner: &dyn CommandRunner) -> TorqueFlavor {
    let args = vec!["pbsnodes".to_string(), "--version".to_string()];
    match runner.run(&args).await {
        Ok(out) if out.contains("PBSPro") => {
            tracing::debug!("PBS Pro proprietary Torque version detected");
            TorqueFlavor::Pro
        }
        Ok(_) => {
            tracing::debug!("Torque OSS version detected");
            TorqueFlavor::Oss
        }
        Err(e) => {
            tracing::error!(error = %e, "Could not determine PBS/Torque version, assuming OSS");
            TorqueFlavor::Oss
        }
    }
}

/// Where the scheduler should write a job's stdout or stderr.
pub fn std_output_path(logs_dir: &Path, scheduler: &str, job_id: BatchJobId, stream: &str) -> PathBuf {
    logs_dir.join(format!(
        "gridflow_job_{job_id}_batch_{scheduler}_${{PBS_JOBID}}_std_{stream}.log"
    ))
}

/// Scheduler job id without its server suffix (`123.head` -> `123`).
pub fn short_job_id(external_id: &str) -> &str {
    external_id.trim().split('.').next().unwrap_or_default()
}

/// Parse tabular `qstat` output into wall times for running jobs.
///
/// Columns are id, name, user, time used, state, queue. Only rows in state
/// `R` for jobs in `current` are reported; a time that cannot be read is 0.
pub fn parse_running_walltimes(
    stdout: &str,
    current: &HashMap<String, BatchJobId>,
) -> HashMap<BatchJobId, f64> {
    let mut times = HashMap::new();
    for line in stdout.lines() {
        let items: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = items.first() else {
            continue;
        };
        let Some(&job_id) = current.get(short_job_id(first)) else {
            continue;
        };
        if items.len() < 5 {
            tracing::warn!(line, "Skipping malformed qstat line");
            continue;
        }
        tracing::debug!(job_id, state = items[4], "qstat job state");
        if items[4] != "R" {
            continue;
        }

        let walltime = match items[3] {
            // qstat reports a bare 0 for jobs that have only just started
            "0" => 0.0,
            raw => hms_duration_to_seconds(raw).unwrap_or_else(|| {
                tracing::warn!(line, "Assuming 0 walltime due to unreadable qstat field");
                0.0
            }),
        };
        times.insert(job_id, walltime);
    }
    times
}

/// Parse `qstat -f` output for a job's exit status.
pub fn parse_exit_code(stdout: &str) -> Option<i32> {
    for line in stdout.lines() {
        let line = line.trim();
        if line.to_lowercase().contains("unknown job id") {
            tracing::debug!("Batch system no longer remembers job");
            return Some(0);
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("failed") && value == "1" {
            return Some(1);
        }
        if key.eq_ignore_ascii_case("exit_status") {
            match value.parse::<i32>() {
                Ok(status) => {
                    tracing::debug!(status, "Exit status");
                    return Some(status);
                }
                Err(_) => tracing::warn!(line, "Unreadable exit status"),
            }
        }
    }
    None
}

/// Convert `[[HH:]MM:]SS` to seconds.
pub fn hms_duration_to_seconds(hms: &str) -> Option<f64> {
    let parts: Vec<&str> = hms.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut seconds = 0.0;
    for (part, scale) in parts.iter().rev().zip([1.0, 60.0, 3600.0]) {
        let value: f64 = part.parse().ok()?;
        if value < 0.0 || !value.is_finite() {
            return None;
        }
        seconds += value * scale;
    }
    Some(seconds)
}

fn mentions_unknown_job(text: &str) -> bool {
    text.to_lowercase().contains("unknown job id")
}

fn check_reserved_keys(value: &str) -> Result<()> {
    if RESERVED_RESOURCE_KEYS.iter().any(|key| value.contains(key)) {
        return Err(GridflowError::Config(format!(
            "Incompatible resource arguments ('mem=', 'nodes=', 'ppn='): {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hms_parses_common_forms() {
        assert_eq!(hms_duration_to_seconds("00:00:05"), Some(5.0));
        assert_eq!(hms_duration_to_seconds("01:02:03"), Some(3723.0));
        assert_eq!(hms_duration_to_seconds("02:30"), Some(150.0));
        assert_eq!(hms_duration_to_seconds("42"), Some(42.0));
    }

    #[test]
    fn hms_rejects_garbage() {
        assert_eq!(hms_duration_to_seconds("--"), None);
        assert_eq!(hms_duration_to_seconds(""), None);
        assert_eq!(hms_duration_to_seconds("1:2:3:4"), None);
        assert_eq!(hms_duration_to_seconds("-1:00"), None);
    }

    #[test]
    fn short_job_id_strips_server() {
        assert_eq!(short_job_id("1234.headnode.cluster"), "1234");
        assert_eq!(short_job_id(" 99 \n"), "99");
        assert_eq!(short_job_id("7"), "7");
    }

    #[test]
    fn exit_code_from_full_status() {
        let out = "Job Id: 12.head\n    job_state = C\n    exit_status = 3\n";
        assert_eq!(parse_exit_code(out), Some(3));
        let pro = "Job Id: 12.head\n    Exit_status = 0\n";
        assert_eq!(parse_exit_code(pro), Some(0));
    }

    #[test]
    fn exit_code_failed_attribute() {
        assert_eq!(parse_exit_code("    FAILED = 1\n"), Some(1));
        assert_eq!(parse_exit_code("    failed = 0\n"), None);
    }

    #[test]
    fn exit_code_absent_while_running() {
        let out = "Job Id: 12.head\n    job_state = R\n    resources_used.walltime = 00:01:00\n";
        assert_eq!(parse_exit_code(out), None);
    }

    #[test]
    fn exit_code_unknown_job_is_success() {
        assert_eq!(parse_exit_code("qstat: Unknown Job Id 12.head\n"), Some(0));
    }

    #[test]
    fn reserved_keys_are_rejected() {
        assert!(check_reserved_keys("walltime=01:00:00").is_ok());
        assert!(matches!(
            check_reserved_keys("mem=4gb"),
            Err(GridflowError::Config(_))
        ));
        assert!(check_reserved_keys("nodes=2").is_err());
        assert!(check_reserved_keys("-l ppn=4").is_err());
    }

    #[test]
    fn walltimes_only_for_running_rows() {
        let stdout = "\
Job ID                    Name             User            Time Use S Queue
------------------------- ---------------- --------------- -------- - -----
10.head                   gridflow_job_1   alice           00:01:40 R batch
11.head                   gridflow_job_2   alice           0        R batch
12.head                   gridflow_job_3   alice           0        Q batch
13.head                   gridflow_job_4   alice           --       R batch
99.head                   other            bob             00:10:00 R batch
14.head short
";
        let current: HashMap<String, BatchJobId> = [
            ("10".to_string(), 1),
            ("11".to_string(), 2),
            ("12".to_string(), 3),
            ("13".to_string(), 4),
            ("14".to_string(), 5),
        ]
        .into_iter()
        .collect();

        let times = parse_running_walltimes(stdout, &current);
        assert_eq!(times.len(), 3);
        assert_eq!(times[&1], 100.0);
        assert_eq!(times[&2], 0.0);
        assert_eq!(times[&4], 0.0);
        assert!(!times.contains_key(&3));
        assert!(!times.contains_key(&5));
    }

    #[test]
    fn output_path_mentions_job_and_stream() {
        let path = std_output_path(Path::new("/logs"), "torque", 7, "err");
        assert_eq!(
            path,
            PathBuf::from("/logs/gridflow_job_7_batch_torque_${PBS_JOBID}_std_err.log")
        );
    }
}
