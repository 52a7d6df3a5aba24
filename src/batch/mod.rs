//! Driving external cluster schedulers.
//!
//! # Components
//!
//! - [`GridEngineDriver`]: generic submit/poll/kill engine running as a background task
//! - [`BatchAdapter`]: the scheduler-specific operations the engine relies on
//! - [`TorqueAdapter`]: PBS/Torque implementation of [`BatchAdapter`]
//! - [`CommandRunner`]: how scheduler tools are invoked, replaceable in tests
//!
//! # Job Flow
//!
//! 1. [`GridEngineDriver::issue_batch_job`] prepares the submission and queues it
//! 2. The engine submits it once fewer than `max_jobs` jobs are running
//! 3. Each poll refreshes wall times in one query, then asks for exit codes
//! 4. A job with an exit code is published as an [`UpdatedBatchJob`] and forgotten
//!
//! External tool failures are never retried here. The caller decides what to
//! do with a failed submission.

pub mod adapter;
pub mod command;
pub mod engine;
pub mod torque;

pub use adapter::{
    BatchAdapter, BatchJobExitReason, BatchJobId, JobRequest, UpdatedBatchJob,
    EXIT_STATUS_UNAVAILABLE,
};
pub use command::{CommandRunner, ProcessRunner};
pub use engine::GridEngineDriver;
pub use torque::TorqueAdapter;
