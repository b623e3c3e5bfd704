//! `genflow-core`: domain foundation for the job-orchestration layer.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): ids,
//! the `Job` and `PipelineExecution` entities, aggregation windows and the
//! shared error model.

pub mod error;
pub mod id;
pub mod job;
pub mod model;
pub mod pagination;
pub mod pipeline;
pub mod timestamp;
pub mod window;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, RecordId, TenantId, UserId};
pub use job::{Job, JobPatch, JobStatus, JobType, JobUpdate};
pub use model::Model;
pub use pagination::{Page, Pagination, SortDirection};
pub use pipeline::{
    NewPipelineExecution, PipelineExecution, PipelineProgressUpdate, PipelineStatus,
    DEFAULT_TOTAL_STAGES,
};
pub use window::{SeriesPoint, Window, WindowUnit};
