//! Generic record persistence.
//!
//! Every persisted entity is a JSON document stored under a model name
//! (`"Job"`, `"PipelineExecution"`, ...). Operations are expressed as data
//! (`Operation`) so a single interception point, `ScopedStore`, can rewrite
//! them for tenant isolation before they reach a backend.
//!
//! ## Backends
//!
//! - `InMemoryRecordStore`: tests/dev
//! - `PostgresRecordStore`: one JSONB table per model

pub mod filter;
pub mod in_memory;
pub mod postgres;
pub mod scoped;
pub mod typed;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use genflow_core::{Pagination, SortDirection};

pub use filter::{Condition, Filter};
pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use scoped::ScopedStore;

/// A stored document (always a JSON object).
pub type Document = serde_json::Map<String, JsonValue>;

/// Sort specification for list operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Kind of an operation, used for logging and by the scoping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    FindMany,
    FindFirst,
    FindUnique,
    Count,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FindMany => "find_many",
            OperationKind::FindFirst => "find_first",
            OperationKind::FindUnique => "find_unique",
            OperationKind::Count => "count",
            OperationKind::Create => "create",
            OperationKind::CreateMany => "create_many",
            OperationKind::Update => "update",
            OperationKind::UpdateMany => "update_many",
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
            OperationKind::DeleteMany => "delete_many",
        }
    }
}

/// A persistence operation against one model.
///
/// `Update`/`UpdateMany`/`Upsert.update` are partial merges: only keys present
/// in `data` change. The `id` key is never rewritten by an update.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FindMany {
        filter: Filter,
        order: Option<OrderBy>,
        pagination: Option<Pagination>,
    },
    FindFirst {
        filter: Filter,
        order: Option<OrderBy>,
    },
    FindUnique {
        filter: Filter,
    },
    Count {
        filter: Filter,
    },
    Create {
        data: Document,
    },
    CreateMany {
        data: Vec<Document>,
    },
    Update {
        filter: Filter,
        data: Document,
    },
    UpdateMany {
        filter: Filter,
        data: Document,
    },
    Upsert {
        filter: Filter,
        create: Document,
        update: Document,
    },
    Delete {
        filter: Filter,
    },
    DeleteMany {
        filter: Filter,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::FindMany { .. } => OperationKind::FindMany,
            Operation::FindFirst { .. } => OperationKind::FindFirst,
            Operation::FindUnique { .. } => OperationKind::FindUnique,
            Operation::Count { .. } => OperationKind::Count,
            Operation::Create { .. } => OperationKind::Create,
            Operation::CreateMany { .. } => OperationKind::CreateMany,
            Operation::Update { .. } => OperationKind::Update,
            Operation::UpdateMany { .. } => OperationKind::UpdateMany,
            Operation::Upsert { .. } => OperationKind::Upsert,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::DeleteMany { .. } => OperationKind::DeleteMany,
        }
    }
}

/// Result of executing an `Operation`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// `FindMany`
    Many(Vec<Document>),
    /// Single-record operations; `None` when nothing matched.
    One(Option<Document>),
    /// `Count` and the bulk writes (affected rows).
    Count(u64),
}

impl Outcome {
    pub fn into_many(self) -> Result<Vec<Document>, StoreError> {
        match self {
            Outcome::Many(docs) => Ok(docs),
            other => Err(StoreError::unexpected("many", &other)),
        }
    }

    pub fn into_one(self) -> Result<Option<Document>, StoreError> {
        match self {
            Outcome::One(doc) => Ok(doc),
            other => Err(StoreError::unexpected("one", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64, StoreError> {
        match self {
            Outcome::Count(n) => Ok(n),
            other => Err(StoreError::unexpected("count", &other)),
        }
    }
}

/// Record store operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated on {model}.{field}")]
    UniqueViolation { model: String, field: String },

    /// The operation is not valid for this backend or model.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A document could not be converted to/from its typed form.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend failed (connection, query, lock).
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation_on(&self, field: &str) -> bool {
        matches!(self, StoreError::UniqueViolation { field: f, .. } if f == field)
    }

    fn unexpected(wanted: &str, got: &Outcome) -> Self {
        let got = match got {
            Outcome::Many(_) => "many",
            Outcome::One(_) => "one",
            Outcome::Count(_) => "count",
        };
        StoreError::InvalidOperation(format!("expected {wanted} outcome, backend returned {got}"))
    }
}

/// Async, model-agnostic record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError> {
        (**self).execute(model, op).await
    }
}
