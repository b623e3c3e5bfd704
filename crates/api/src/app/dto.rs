use serde::Deserialize;

use genflow_core::{
    JobStatus, JobType, NewPipelineExecution, Pagination, PipelineProgressUpdate, PipelineStatus,
    SortDirection, TenantId,
};
use genflow_infra::{JobFilter, PipelineFilter, PipelineSort, PipelineSortField};

// -------------------------
// Query DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListJobsQuery {
    pub fn filter(&self) -> JobFilter {
        JobFilter {
            job_type: self.job_type,
            status: self.status,
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    pub window: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPipelinesQuery {
    pub status: Option<PipelineStatus>,
    pub sort_by: Option<PipelineSortField>,
    pub sort_order: Option<SortDirection>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListPipelinesQuery {
    pub fn filter(&self) -> PipelineFilter {
        PipelineFilter { status: self.status }
    }

    pub fn sort(&self) -> PipelineSort {
        PipelineSort {
            field: self.sort_by.unwrap_or_default(),
            direction: self.sort_order.unwrap_or_default(),
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

// -------------------------
// Webhook bodies
// -------------------------

/// Pipeline creation from the workflow engine.
pub type CreatePipelineRequest = NewPipelineExecution;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgressRequest {
    pub execution_id: String,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub updates: PipelineProgressUpdate,
}
