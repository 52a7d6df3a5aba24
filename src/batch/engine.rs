use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use async_channel::{Receiver, Sender};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::adapter::{
    BatchAdapter, BatchJobExitReason, BatchJobId, JobRequest, UpdatedBatchJob,
    EXIT_STATUS_UNAVAILABLE,
};
use crate::config::DriverConfig;
use crate::error::{GridflowError, Result};

/// A job the scheduler has accepted.
#[derive(Debug, Clone)]
struct RunningBatchJob {
    external_id: String,
    /// Last wall time the scheduler reported, in seconds
    wall_time: f64,
    submitted_at: DateTime<Utc>,
    /// Kill sent to the scheduler, waiting for an exit status to confirm it
    kill_requested: bool,
}

/// Answer to a kill request: the job is gone, or the kill command failed.
#[derive(Debug)]
struct KillOutcome {
    job_id: BatchJobId,
    result: Result<()>,
}

type RunningJobs = Arc<Mutex<HashMap<BatchJobId, RunningBatchJob>>>;

/// Submission command line built at issue time.
#[derive(Debug)]
struct PreparedJob {
    job_id: BatchJobId,
    job_name: String,
    argv: Vec<String>,
}

/// Scheduler-agnostic driver for grid engine style batch systems.
///
/// A background task submits issued jobs, polls the scheduler for the ones
/// it has accepted, and handles kill requests. Callers interact through
/// queues:
///
/// - [`issue_batch_job`](Self::issue_batch_job) feeds the submission queue
/// - [`get_updated_batch_job`](Self::get_updated_batch_job) drains finished jobs
/// - [`kill_batch_jobs`](Self::kill_batch_jobs) feeds the kill queue and waits until the
///   scheduler reports the job gone
///
/// The scheduler-specific parts live behind [`BatchAdapter`].
pub struct GridEngineDriver {
    adapter: Arc<dyn BatchAdapter>,
    config: DriverConfig,
    next_job_id: AtomicU64,
    running: RunningJobs,
    /// Jobs issued and not yet reported back to the caller
    issued: Mutex<HashSet<BatchJobId>>,
    /// Kill outcomes received by one caller on behalf of another
    kill_outcomes: Mutex<HashMap<BatchJobId, Result<()>>>,
    terminate: CancellationToken,
    new_jobs: UnboundedSender<PreparedJob>,
    kill_queue: UnboundedSender<BatchJobId>,
    updated_jobs: Receiver<UpdatedBatchJob>,
    killed_jobs: Receiver<KillOutcome>,
    worker: Mutex<Option<GridEngineWorker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GridEngineDriver {
    pub fn new(adapter: Arc<dyn BatchAdapter>, config: DriverConfig) -> Self {
        let terminate = CancellationToken::new();
        let running: RunningJobs = Arc::new(Mutex::new(HashMap::new()));
        let (new_jobs, new_jobs_rx) = mpsc::unbounded_channel();
        let (kill_queue, kill_queue_rx) = mpsc::unbounded_channel();
        let (updated_tx, updated_jobs) = async_channel::unbounded();
        let (killed_tx, killed_jobs) = async_channel::unbounded();

        let worker = GridEngineWorker {
            adapter: adapter.clone(),
            state_polling_wait: config.state_polling_wait,
            max_jobs: config.max_jobs,
            running: running.clone(),
            terminate: terminate.clone(),
            new_jobs: new_jobs_rx,
            kill_queue: kill_queue_rx,
            updated_jobs: updated_tx,
            killed_jobs: killed_tx,
            waiting: VecDeque::new(),
        };

        Self {
            adapter,
            config,
            next_job_id: AtomicU64::new(1),
            running,
            issued: Mutex::new(HashSet::new()),
            kill_outcomes: Mutex::new(HashMap::new()),
            terminate,
            new_jobs,
            kill_queue,
            updated_jobs,
            killed_jobs,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the submission and polling task.
    pub fn start(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| GridflowError::Internal("driver already started".into()))?;
        *self.handle.lock() = Some(tokio::spawn(worker.run()));
        tracing::debug!(scheduler = self.adapter.name(), "Batch system driver started");
        Ok(())
    }

    /// Prepare a job for submission and queue it.
    ///
    /// The submission command is built here, so configuration errors are
    /// returned to the caller before anything reaches the scheduler.
    pub fn issue_batch_job(&self, request: JobRequest) -> Result<BatchJobId> {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let mut request = request;
        request.environment = self.job_environment(&request.environment);

        let argv = self
            .adapter
            .prepare_submission(job_id, &request, &self.config.batch_logs_dir)?;
        self.issued.lock().insert(job_id);
        self.new_jobs
            .send(PreparedJob {
                job_id,
                job_name: request.job_name.clone(),
                argv,
            })
            .map_err(|_| GridflowError::DriverDied)?;
        tracing::debug!(job_id, job_name = %request.job_name, "Issued batch job");
        Ok(job_id)
    }

    /// Wait up to `timeout` for a job to finish.
    pub async fn get_updated_batch_job(&self, timeout: Duration) -> Option<UpdatedBatchJob> {
        let update = tokio::time::timeout(timeout, self.updated_jobs.recv())
            .await
            .ok()?
            .ok()?;
        self.issued.lock().remove(&update.job_id);
        Some(update)
    }

    /// Kill jobs and wait until the scheduler no longer runs any of them.
    ///
    /// A job counts as killed once the scheduler reports an exit status for
    /// it after the kill. If the scheduler rejects a kill, that error is
    /// returned and the job stays tracked, so its outcome is still reported
    /// through [`get_updated_batch_job`](Self::get_updated_batch_job).
    pub async fn kill_batch_jobs(&self, job_ids: &[BatchJobId]) -> Result<()> {
        let mut outstanding: HashSet<BatchJobId> = job_ids.iter().copied().collect();
        for &job_id in &outstanding {
            tracing::debug!(job_id, "Requesting kill");
            self.kill_queue
                .send(job_id)
                .map_err(|_| GridflowError::DriverDied)?;
        }

        loop {
            let claimed: Vec<(BatchJobId, Result<()>)> = {
                let mut outcomes = self.kill_outcomes.lock();
                outstanding
                    .iter()
                    .filter_map(|job_id| outcomes.remove(job_id).map(|r| (*job_id, r)))
                    .collect()
            };
            let mut failure = None;
            for (job_id, result) in claimed {
                outstanding.remove(&job_id);
                if let Err(e) = result {
                    tracing::warn!(job_id, error = %e, "Kill was rejected");
                    failure.get_or_insert(e);
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
            if outstanding.is_empty() {
                return Ok(());
            }
            self.health_check()?;

            let wait = self.config.state_polling_wait;
            if let Ok(Ok(outcome)) = tokio::time::timeout(wait, self.killed_jobs.recv()).await {
                if outcome.result.is_ok() {
                    self.issued.lock().remove(&outcome.job_id);
                }
                self.kill_outcomes
                    .lock()
                    .insert(outcome.job_id, outcome.result);
            }
        }
    }

    /// Last-known wall time, in seconds, of every job the scheduler has
    /// accepted. Jobs without a reported time yet show 0.
    pub fn running_batch_job_ids(&self) -> HashMap<BatchJobId, f64> {
        self.running
            .lock()
            .iter()
            .map(|(job_id, job)| (*job_id, job.wall_time))
            .collect()
    }

    /// Every job issued and not yet reported finished or killed.
    pub fn issued_batch_job_ids(&self) -> Vec<BatchJobId> {
        let mut ids: Vec<BatchJobId> = self.issued.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Fail if the background task has stopped without being asked to.
    pub fn health_check(&self) -> Result<()> {
        match self.handle.lock().as_ref() {
            Some(handle) if !handle.is_finished() => Ok(()),
            _ => Err(GridflowError::DriverDied),
        }
    }

    /// Stop the background task and wait for it.
    pub async fn shutdown(&self) {
        self.terminate.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Batch system driver panicked");
            }
        }
        tracing::debug!(scheduler = self.adapter.name(), "Batch system driver shut down");
    }

    fn job_environment(&self, job_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for (key, value) in &self.config.environment {
            match value {
                Some(value) => {
                    env.insert(key.clone(), value.clone());
                }
                None => match std::env::var(key) {
                    Ok(value) => {
                        env.insert(key.clone(), value);
                    }
                    Err(_) => tracing::warn!(key = %key, "Environment variable to forward is not set"),
                },
            }
        }
        env.extend(job_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Background half of the driver. Owns the waiting queue; shares only the
/// running-jobs map with the caller-facing half.
struct GridEngineWorker {
    adapter: Arc<dyn BatchAdapter>,
    state_polling_wait: Duration,
    max_jobs: usize,
    running: RunningJobs,
    terminate: CancellationToken,
    new_jobs: UnboundedReceiver<PreparedJob>,
    kill_queue: UnboundedReceiver<BatchJobId>,
    updated_jobs: Sender<UpdatedBatchJob>,
    killed_jobs: Sender<KillOutcome>,
    /// Issued jobs not yet submitted because of `max_jobs`
    waiting: VecDeque<PreparedJob>,
}

impl GridEngineWorker {
    async fn run(mut self) {
        loop {
            if self.terminate.is_cancelled() {
                tracing::debug!("Batch system driver received signal to quit");
                break;
            }

            let mut activity = self.create_jobs().await;
            activity |= self.kill_jobs().await;

            if !activity {
                self.check_on_jobs().await;
                tokio::select! {
                    _ = self.terminate.cancelled() => {}
                    _ = tokio::time::sleep(self.state_polling_wait) => {}
                }
            }
        }
    }

    fn drain_new_jobs(&mut self) {
        while let Ok(job) = self.new_jobs.try_recv() {
            self.waiting.push_back(job);
        }
    }

    fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Submit waiting jobs while there is room under `max_jobs`.
    async fn create_jobs(&mut self) -> bool {
        self.drain_new_jobs();
        let mut activity = false;

        while self.running_count() < self.max_jobs {
            let Some(job) = self.waiting.pop_front() else {
                break;
            };
            activity = true;

            match self.adapter.submit_job(&job.argv).await {
                Ok(external_id) => {
                    tracing::info!(
                        job_id = job.job_id,
                        job_name = %job.job_name,
                        external_id = %external_id,
                        "Submitted batch job"
                    );
                    self.running.lock().insert(
                        job.job_id,
                        RunningBatchJob {
                            external_id,
                            wall_time: 0.0,
                            submitted_at: Utc::now(),
                            kill_requested: false,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = job.job_id, error = %e, "Could not submit batch job");
                    self.publish_update(UpdatedBatchJob {
                        job_id: job.job_id,
                        exit_status: EXIT_STATUS_UNAVAILABLE,
                        exit_reason: BatchJobExitReason::Error,
                        wall_time: None,
                        observed_at: Utc::now(),
                    });
                }
            }
        }
        activity
    }

    /// Handle every pending kill request.
    ///
    /// A job the scheduler accepted stays in `running` until a later poll
    /// sees its exit status; only then is the kill confirmed.
    async fn kill_jobs(&mut self) -> bool {
        let mut activity = false;
        while let Ok(job_id) = self.kill_queue.try_recv() {
            activity = true;
            self.drain_new_jobs();

            if let Some(pos) = self.waiting.iter().position(|job| job.job_id == job_id) {
                self.waiting.remove(pos);
                tracing::debug!(job_id, "Dropped job before submission");
                self.confirm_kill(job_id, Ok(()));
                continue;
            }

            let external_id = self
                .running
                .lock()
                .get(&job_id)
                .map(|job| job.external_id.clone());
            let Some(external_id) = external_id else {
                tracing::debug!(job_id, "Kill requested for a job that is not running");
                self.confirm_kill(job_id, Ok(()));
                continue;
            };

            match self.adapter.kill_job(&external_id).await {
                Ok(()) => {
                    tracing::info!(job_id, external_id = %external_id, "Sent kill for batch job");
                    if let Some(job) = self.running.lock().get_mut(&job_id) {
                        job.kill_requested = true;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        job_id,
                        external_id = %external_id,
                        error = %e,
                        "Kill request failed"
                    );
                    self.confirm_kill(job_id, Err(e));
                }
            }
        }
        activity
    }

    /// Refresh wall times and collect exit codes of running jobs.
    async fn check_on_jobs(&mut self) {
        let snapshot: HashMap<BatchJobId, String> = self
            .running
            .lock()
            .iter()
            .map(|(job_id, job)| (*job_id, job.external_id.clone()))
            .collect();
        if snapshot.is_empty() {
            return;
        }

        match self.adapter.get_running_job_ids(&snapshot).await {
            Ok(times) => {
                let mut running = self.running.lock();
                for (job_id, wall_time) in times {
                    if let Some(job) = running.get_mut(&job_id) {
                        job.wall_time = wall_time;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not query running job wall times"),
        }

        for (job_id, external_id) in snapshot {
            let exit_status = match self.adapter.get_job_exit_code(&external_id).await {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job_id, external_id = %external_id, error = %e, "Could not get exit code");
                    continue;
                }
            };

            let Some(job) = self.running.lock().remove(&job_id) else {
                continue;
            };
            if job.kill_requested {
                tracing::info!(job_id, external_id = %external_id, exit_status, "Batch job killed");
                self.confirm_kill(job_id, Ok(()));
                continue;
            }
            let exit_reason = if exit_status == 0 {
                BatchJobExitReason::Finished
            } else {
                BatchJobExitReason::Failed
            };
            tracing::info!(
                job_id,
                external_id = %external_id,
                exit_status,
                submitted_at = %job.submitted_at,
                "Batch job finished"
            );
            self.publish_update(UpdatedBatchJob {
                job_id,
                exit_status,
                exit_reason,
                wall_time: (job.wall_time > 0.0).then_some(job.wall_time),
                observed_at: Utc::now(),
            });
        }
    }

    fn publish_update(&self, update: UpdatedBatchJob) {
        if self.updated_jobs.try_send(update).is_err() {
            tracing::debug!("Driver dropped, discarding job update");
        }
    }

    fn confirm_kill(&self, job_id: BatchJobId, result: Result<()>) {
        if self.killed_jobs.try_send(KillOutcome { job_id, result }).is_err() {
            tracing::debug!(job_id, "Nobody waiting on kill confirmation");
        }
    }
}
