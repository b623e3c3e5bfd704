//! Orchestration layer: tenant scoping, record storage, job queues, the job
//! service and its workers, outcome analytics and pipeline tracking.

pub mod analytics;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipelines;
pub mod queue;
pub mod store;
pub mod tenancy;

pub use analytics::OutcomeAggregator;
pub use config::AppConfig;
pub use error::{OrchestrationError, OrchestrationResult};
pub use jobs::{
    CreateJob, DryRunProcessor, JobFilter, JobProcessor, JobService, JobServiceConfig, ProcessOutput,
    QueueWorker, WorkerConfig, WorkerHandle, WorkerStats,
};
pub use pipelines::{PipelineFilter, PipelineSort, PipelineSortField, PipelineTracker};
pub use queue::{InMemoryQueue, JobQueue, QueueConsumer, QueueCounts, QueueError, QueueSet, RetryPolicy};
pub use store::{InMemoryRecordStore, PostgresRecordStore, RecordStore, ScopedStore, StoreError};
pub use tenancy::{RequestContext, TenantScope};
