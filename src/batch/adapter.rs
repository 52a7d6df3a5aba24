use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Driver-assigned id of a batch job. The scheduler's own id is kept
/// separately and never leaves the driver.
pub type BatchJobId = u64;

/// Exit status reported when the real one cannot be known, e.g. when
/// submission itself failed.
pub const EXIT_STATUS_UNAVAILABLE: i32 = 255;

/// A job to run on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub command: String,
    pub job_name: String,
    pub cpu: f64,
    /// Bytes. Zero means no memory request.
    pub memory: u64,
    pub environment: BTreeMap<String, String>,
    pub gpus: Option<u32>,
}

impl JobRequest {
    pub fn new(job_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            job_name: job_name.into(),
            cpu: 1.0,
            memory: 0,
            environment: BTreeMap::new(),
            gpus: None,
        }
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = Some(gpus);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobExitReason {
    /// Exited with status zero
    Finished,
    /// Exited with a non-zero status
    Failed,
    /// The driver could not run the job at all
    Error,
}

impl std::fmt::Display for BatchJobExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchJobExitReason::Finished => write!(f, "finished"),
            BatchJobExitReason::Failed => write!(f, "failed"),
            BatchJobExitReason::Error => write!(f, "error"),
        }
    }
}

/// Terminal state of a batch job, published once per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedBatchJob {
    pub job_id: BatchJobId,
    pub exit_status: i32,
    pub exit_reason: BatchJobExitReason,
    /// Seconds of wall clock the scheduler reported, if it reported any
    pub wall_time: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Scheduler-specific half of the grid engine driver.
///
/// Implementations translate the driver's requests into invocations of the
/// scheduler's command-line tools and parse what comes back. All output
/// format knowledge stays behind this trait.
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    /// Short scheduler name used in logs and output file names
    fn name(&self) -> &'static str;

    /// Build the full submission command line for a job.
    ///
    /// Any wrapper script the scheduler needs is written here, under
    /// `logs_dir`. Configuration problems are reported now rather than left
    /// for the scheduler to reject.
    fn prepare_submission(
        &self,
        job_id: BatchJobId,
        request: &JobRequest,
        logs_dir: &Path,
    ) -> Result<Vec<String>>;

    /// Run a prepared submission and return the scheduler's id for the job.
    async fn submit_job(&self, argv: &[String]) -> Result<String>;

    /// Wall time in seconds for each given job that the scheduler reports as
    /// running, in a single query. `jobs` maps driver ids to scheduler ids.
    async fn get_running_job_ids(
        &self,
        jobs: &HashMap<BatchJobId, String>,
    ) -> Result<HashMap<BatchJobId, f64>>;

    /// Exit status of a finished job, or `None` while it is still running.
    async fn get_job_exit_code(&self, external_id: &str) -> Result<Option<i32>>;

    /// Ask the scheduler to cancel a job.
    async fn kill_job(&self, external_id: &str) -> Result<()>;
}
