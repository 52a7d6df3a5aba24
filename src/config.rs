use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding extra `-l` resource requests for qsub.
pub const TORQUE_REQS_ENV: &str = "GRIDFLOW_TORQUE_REQS";
/// Environment variable holding extra native qsub arguments.
pub const TORQUE_ARGS_ENV: &str = "GRIDFLOW_TORQUE_ARGS";

/// Configuration for the service manager coordination loop.
#[derive(Debug, Clone)]
pub struct ServiceManagerConfig {
    /// How often the loop checks the job store for marker changes
    pub poll_interval: Duration,
    /// Minimum spacing between "services are starting" progress logs
    pub log_interval: Duration,
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            log_interval: Duration::from_secs(60),
        }
    }
}

impl ServiceManagerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }
}

/// Configuration for the generic grid engine driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Wait between scheduler status queries
    pub state_polling_wait: Duration,
    /// Maximum number of jobs submitted to the scheduler at once
    pub max_jobs: usize,
    /// Directory the scheduler writes job stdout/stderr into.
    /// Must be visible from both the leader and the workers.
    pub batch_logs_dir: PathBuf,
    /// Environment forwarded to every job. A `None` value is looked up
    /// in the leader's own environment at submission time.
    pub environment: BTreeMap<String, Option<String>>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            state_polling_wait: Duration::from_secs(1),
            max_jobs: usize::MAX,
            batch_logs_dir: std::env::temp_dir(),
            environment: BTreeMap::new(),
        }
    }
}

impl DriverConfig {
    pub fn with_state_polling_wait(mut self, wait: Duration) -> Self {
        self.state_polling_wait = wait;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_batch_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.batch_logs_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.environment.insert(key.into(), value);
        self
    }
}

/// Which PBS/Torque family the cluster runs. The two disagree on
/// qstat flags and resource request syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorqueFlavor {
    /// Open-source Torque
    Oss,
    /// Proprietary PBS Pro
    Pro,
}

/// Torque adapter settings.
#[derive(Debug, Clone, Default)]
pub struct TorqueConfig {
    /// Force a flavour instead of probing `pbsnodes --version`
    pub flavor: Option<TorqueFlavor>,
    /// Extra resource requests appended to `-l`
    pub extra_reqs: Option<String>,
    /// Extra native qsub arguments, shell-split before use
    pub extra_args: Option<String>,
}

impl TorqueConfig {
    /// Read resource and argument overrides from the process environment.
    ///
    /// Values are validated when a submission is prepared, not here, so a bad
    /// override only fails the jobs that would have used it.
    pub fn from_env() -> Self {
        Self {
            flavor: None,
            extra_reqs: std::env::var(TORQUE_REQS_ENV).ok(),
            extra_args: std::env::var(TORQUE_ARGS_ENV).ok(),
        }
    }

    pub fn with_flavor(mut self, flavor: TorqueFlavor) -> Self {
        self.flavor = Some(flavor);
        self
    }

    pub fn with_extra_reqs(mut self, reqs: impl Into<String>) -> Self {
        self.extra_reqs = Some(reqs.into());
        self
    }

    pub fn with_extra_args(mut self, args: impl Into<String>) -> Self {
        self.extra_args = Some(args.into());
        self
    }
}
