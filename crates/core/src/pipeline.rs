//! The `PipelineExecution` entity: one externally orchestrated workflow run.
//!
//! The workflow engine drives the run through webhooks; this side only records
//! what it is told. Stage ordering is nominal and not enforced here.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::{RecordId, TenantId};
use crate::model::Model;
use crate::timestamp;

/// Stage count assumed when the creating webhook does not say.
pub const DEFAULT_TOTAL_STAGES: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Started,
    Validating,
    Training,
    TrainingComplete,
    GeneratingImages,
    ImagesComplete,
    GeneratingVideos,
    VideosComplete,
    Aggregating,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 11] = [
        PipelineStatus::Started,
        PipelineStatus::Validating,
        PipelineStatus::Training,
        PipelineStatus::TrainingComplete,
        PipelineStatus::GeneratingImages,
        PipelineStatus::ImagesComplete,
        PipelineStatus::GeneratingVideos,
        PipelineStatus::VideosComplete,
        PipelineStatus::Aggregating,
        PipelineStatus::Completed,
        PipelineStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Started => "STARTED",
            PipelineStatus::Validating => "VALIDATING",
            PipelineStatus::Training => "TRAINING",
            PipelineStatus::TrainingComplete => "TRAINING_COMPLETE",
            PipelineStatus::GeneratingImages => "GENERATING_IMAGES",
            PipelineStatus::ImagesComplete => "IMAGES_COMPLETE",
            PipelineStatus::GeneratingVideos => "GENERATING_VIDEOS",
            PipelineStatus::VideosComplete => "VIDEOS_COMPLETE",
            PipelineStatus::Aggregating => "AGGREGATING",
            PipelineStatus::Completed => "COMPLETED",
            PipelineStatus::Failed => "FAILED",
        }
    }

    /// Position in the nominal forward sequence. `FAILED` has none.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            PipelineStatus::Failed => None,
            other => PipelineStatus::ALL
                .iter()
                .position(|s| s == other)
                .map(|p| p as u8),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    /// True when moving from `self` to `next` goes backwards in the nominal order.
    pub fn is_regression_to(&self, next: PipelineStatus) -> bool {
        match (self.ordinal(), next.ordinal()) {
            (Some(from), Some(to)) => to < from,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown pipeline status: {s}")))
    }
}

/// Tracking row for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    pub id: RecordId,
    /// Supplied by the workflow engine; unique and immutable.
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: TenantId,
    pub status: PipelineStatus,
    /// Snapshot of the triggering request.
    pub payload: JsonValue,
    #[serde(default)]
    pub current_stage: Option<String>,
    pub stages_completed: i32,
    pub total_stages: i32,
    pub progress_percent: i32,
    #[serde(default)]
    pub training_job_id: Option<String>,
    #[serde(default)]
    pub image_job_ids: Vec<String>,
    #[serde(default)]
    pub video_job_ids: Vec<String>,
    #[serde(default)]
    pub asset_ids: Vec<String>,
    #[serde(default)]
    pub lora_path: Option<String>,
    pub total_cost_tok: i64,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stage: Option<String>,
}

impl Model for PipelineExecution {
    const MODEL: &'static str = "PipelineExecution";
}

impl PipelineExecution {
    /// Fresh run in `STARTED` with zeroed progress counters.
    pub fn start(new: NewPipelineExecution, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::new(),
            execution_id: new.execution_id,
            workflow_id: new.workflow_id,
            tenant_id: new.tenant_id,
            status: PipelineStatus::Started,
            payload: new.payload,
            current_stage: None,
            stages_completed: 0,
            total_stages: new.total_stages.unwrap_or(DEFAULT_TOTAL_STAGES),
            progress_percent: 0,
            training_job_id: None,
            image_job_ids: Vec::new(),
            video_job_ids: Vec::new(),
            asset_ids: Vec::new(),
            lora_path: None,
            total_cost_tok: 0,
            started_at: now,
            completed_at: None,
            error_message: None,
            error_stage: None,
        }
    }
}

/// Body of the "create pipeline" webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPipelineExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub total_stages: Option<i32>,
}

impl NewPipelineExecution {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.execution_id.trim().is_empty() {
            return Err(DomainError::validation("executionId must not be empty"));
        }
        if self.workflow_id.trim().is_empty() {
            return Err(DomainError::validation("workflowId must not be empty"));
        }
        if matches!(self.total_stages, Some(n) if n < 1) {
            return Err(DomainError::validation("totalStages must be at least 1"));
        }
        Ok(())
    }
}

/// Partial progress update. Only present fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages_completed: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_job_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_job_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_tok: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp::option"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
}

impl PipelineProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self == &PipelineProgressUpdate::default()
    }

    /// Clamp `progressPercent` into 0..=100.
    pub fn normalized(mut self) -> Self {
        if let Some(p) = self.progress_percent {
            self.progress_percent = Some(p.clamp(0, 100));
        }
        self
    }
}
