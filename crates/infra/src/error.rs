//! Orchestration-level error taxonomy.

use thiserror::Error;

use genflow_core::{DomainError, JobId};

use crate::queue::QueueError;
use crate::store::StoreError;

/// Error returned by the job service, the aggregator and the pipeline tracker.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Missing, or owned by another tenant. The two are indistinguishable.
    #[error("not found")]
    NotFound,

    #[error("unauthorized: no tenant in context")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// The job was persisted but could not be enqueued; it stays `pending`.
    #[error("failed to dispatch job {job_id}: {source}")]
    UpstreamDispatchFailure {
        job_id: JobId,
        #[source]
        source: QueueError,
    },

    /// A queue call unrelated to a specific dispatch failed (counts, worker I/O).
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for OrchestrationError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::NotFound,
            DomainError::Unauthorized => Self::Unauthorized,
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::InvalidWindow(msg) => Self::InvalidWindow(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
        }
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
