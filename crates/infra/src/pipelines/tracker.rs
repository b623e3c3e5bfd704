use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use genflow_core::{
    NewPipelineExecution, Page, Pagination, PipelineExecution, PipelineProgressUpdate,
    PipelineStatus, SortDirection, TenantId, timestamp,
};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::store::{Filter, OrderBy, RecordStore, ScopedStore, typed};
use crate::tenancy::{RequestContext, TENANT_FIELD};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PipelineFilter {
    #[serde(default)]
    pub status: Option<PipelineStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineSortField {
    #[default]
    StartedAt,
    CompletedAt,
    ProgressPercent,
}

impl PipelineSortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSortField::StartedAt => "startedAt",
            PipelineSortField::CompletedAt => "completedAt",
            PipelineSortField::ProgressPercent => "progressPercent",
        }
    }
}

/// Defaults to newest `startedAt` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PipelineSort {
    #[serde(default, rename = "sortBy")]
    pub field: PipelineSortField,
    #[serde(default, rename = "sortOrder")]
    pub direction: SortDirection,
}

/// Owns `PipelineExecution` records.
///
/// Executions are keyed by the workflow engine's `executionId`. Creation is
/// idempotent through the store's unique constraint on that key, and every
/// read or write checks the owning tenant explicitly so a foreign execution
/// looks exactly like a missing one.
pub struct PipelineTracker<S> {
    store: Arc<ScopedStore<S>>,
}

impl<S> Clone for PipelineTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> PipelineTracker<S>
where
    S: RecordStore,
{
    pub fn new(store: Arc<ScopedStore<S>>) -> Self {
        Self { store }
    }

    /// Record a new run in `STARTED`. Replaying the same `executionId` returns
    /// the original record for the same tenant and `Conflict` for another.
    #[instrument(skip(self, new), fields(execution_id = %new.execution_id, tenant_id = %new.tenant_id), err)]
    pub async fn create(&self, new: NewPipelineExecution) -> OrchestrationResult<PipelineExecution> {
        new.validate()?;
        let execution = PipelineExecution::start(new, timestamp::now());

        match typed::create(&*self.store, &execution).await {
            Ok(created) => {
                info!(workflow_id = %created.workflow_id, "pipeline execution started");
                Ok(created)
            }
            Err(e) if e.is_unique_violation_on("executionId") => {
                let existing = self
                    .load(&execution.execution_id)
                    .await?
                    .ok_or(OrchestrationError::Store(e))?;
                if existing.tenant_id == execution.tenant_id {
                    debug!("duplicate pipeline creation; returning existing execution");
                    Ok(existing)
                } else {
                    warn!("executionId already owned by another tenant");
                    Err(OrchestrationError::Conflict(format!(
                        "executionId {} is already in use",
                        execution.execution_id
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_by_execution_id(&self, execution_id: &str) -> OrchestrationResult<PipelineExecution> {
        let tenant = RequestContext::require_tenant()?;
        self.load_owned(execution_id, tenant).await
    }

    /// Apply the fields present in `updates`; absent fields are untouched.
    /// Transition order is not enforced; regressions are only logged.
    #[instrument(skip(self, updates), err)]
    pub async fn update_progress(
        &self,
        execution_id: &str,
        updates: PipelineProgressUpdate,
    ) -> OrchestrationResult<PipelineExecution> {
        let tenant = RequestContext::require_tenant()?;
        let existing = self.load_owned(execution_id, tenant).await?;

        let updates = updates.normalized();
        if updates.is_empty() {
            return Ok(existing);
        }
        if let Some(next) = updates.status {
            if existing.status.is_regression_to(next) {
                warn!(from = %existing.status, to = %next, "pipeline status moved backwards");
            }
        }

        let filter = Filter::new()
            .eq("executionId", execution_id)
            .eq(TENANT_FIELD, tenant.to_string());
        let updated: PipelineExecution = typed::update(&*self.store, filter, &updates)
            .await?
            .ok_or(OrchestrationError::NotFound)?;

        if let Some(status) = updates.status {
            info!(status = %status, progress = updated.progress_percent, "pipeline progress");
        }
        Ok(updated)
    }

    pub async fn list(
        &self,
        filter: PipelineFilter,
        pagination: Pagination,
        sort: PipelineSort,
    ) -> OrchestrationResult<Page<PipelineExecution>> {
        let tenant = RequestContext::require_tenant()?;
        let mut query = Filter::new().eq(TENANT_FIELD, tenant.to_string());
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }
        let order = OrderBy {
            field: sort.field.as_str().to_string(),
            direction: sort.direction,
        };

        let total = typed::count::<PipelineExecution, _>(&*self.store, query.clone()).await?;
        let items = typed::find_many(&*self.store, query, Some(order), Some(pagination)).await?;
        Ok(Page::new(items, total, pagination))
    }

    async fn load(&self, execution_id: &str) -> OrchestrationResult<Option<PipelineExecution>> {
        Ok(typed::find_unique(&*self.store, Filter::new().eq("executionId", execution_id)).await?)
    }

    async fn load_owned(&self, execution_id: &str, tenant: TenantId) -> OrchestrationResult<PipelineExecution> {
        match self.load(execution_id).await? {
            Some(execution) if execution.tenant_id == tenant => Ok(execution),
            _ => Err(OrchestrationError::NotFound),
        }
    }
}
