//! Job lifecycle: creation, dispatch, worker callbacks and the in-process
//! worker runtime.
//!
//! ## Components
//!
//! - `JobService`: owns `Job` records and hands tasks to the queues
//! - `QueueWorker`: reserves tasks, runs a `JobProcessor`, reports back
//! - `dry_run`: synthetic results for jobs that skip real work

pub mod dry_run;
pub mod service;
pub mod worker;

pub use service::{CreateJob, JobFilter, JobService, JobServiceConfig};
pub use worker::{
    DryRunProcessor, JobProcessor, ProcessOutput, QueueWorker, WorkerConfig, WorkerHandle,
    WorkerStats,
};
