//! The `Job` entity: one discrete unit of asynchronous generation work.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::{JobId, TenantId};
use crate::model::Model;
use crate::timestamp;

/// Kind of generation work. Each kind has its own queue topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    ContentGeneration,
    ImageGeneration,
    LoraTraining,
    VideoGeneration,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::ContentGeneration,
        JobType::ImageGeneration,
        JobType::LoraTraining,
        JobType::VideoGeneration,
    ];

    /// Wire name, also used as the queue topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ContentGeneration => "content-generation",
            JobType::ImageGeneration => "image-generation",
            JobType::LoraTraining => "lora-training",
            JobType::VideoGeneration => "video-generation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted, waiting for a worker
    Pending,
    /// Picked up by a worker
    Running,
    Succeeded,
    Failed,
    /// Legacy success marker still written by some workers
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Completed
        )
    }

    /// Counted as a success by outcome analytics.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Completed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// A persisted job record.
///
/// Field names are part of the external contract (dashboards read them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// `None` only for system jobs created outside a tenant-scoped request.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: JsonValue,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub cost_tok: Option<i64>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Model for Job {
    const MODEL: &'static str = "Job";
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        tenant_id: Option<TenantId>,
        job_type: JobType,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            job_type,
            status: JobStatus::Pending,
            payload,
            result: None,
            cost_tok: None,
            started_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    /// Compute the partial write for `update`, including lifecycle timestamps.
    ///
    /// - `running` sets `startedAt` unless already set.
    /// - a terminal status sets `finishedAt`, and backfills `startedAt` with the
    ///   same instant if the job never ran.
    pub fn plan_update(&self, update: &JobUpdate, now: DateTime<Utc>) -> JobPatch {
        let mut patch = JobPatch {
            status: update.status,
            result: update.result.clone(),
            cost_tok: update.cost_tok,
            started_at: None,
            finished_at: None,
        };

        match update.status {
            Some(JobStatus::Running) if self.started_at.is_none() => {
                patch.started_at = Some(now);
            }
            Some(status) if status.is_terminal() => {
                patch.finished_at = Some(now);
                if self.started_at.is_none() {
                    patch.started_at = Some(now);
                }
            }
            _ => {}
        }

        patch
    }

    /// Apply a patch in place (mirrors what the store does with the JSON form).
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }
        if let Some(cost) = patch.cost_tok {
            self.cost_tok = Some(cost);
        }
        if let Some(ts) = patch.started_at {
            self.started_at = Some(ts);
        }
        if let Some(ts) = patch.finished_at {
            self.finished_at = Some(ts);
        }
    }
}

/// Worker callback / operator update: all fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub cost_tok: Option<i64>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_cost(mut self, cost_tok: i64) -> Self {
        self.cost_tok = Some(cost_tok);
        self
    }
}

/// The partial document written for a job update. Absent fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_tok: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp::option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp::option"
    )]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self == &JobPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn pending_job() -> Job {
        Job::new(
            Some(TenantId::new()),
            JobType::ContentGeneration,
            json!({"foo": "bar"}),
            t0(),
        )
    }

    #[test]
    fn running_sets_started_at_once() {
        let mut job = pending_job();
        let patch = job.plan_update(&JobUpdate::status(JobStatus::Running), t0());
        assert_eq!(patch.started_at, Some(t0()));
        assert_eq!(patch.finished_at, None);
        job.apply(&patch);

        let later = t0() + Duration::minutes(5);
        let patch = job.plan_update(&JobUpdate::status(JobStatus::Running), later);
        assert_eq!(patch.started_at, None);
    }

    #[test]
    fn terminal_without_running_backfills_started_at() {
        for status in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::Completed] {
            let mut job = pending_job();
            let now = t0() + Duration::seconds(42);
            let patch = job.plan_update(&JobUpdate::status(status), now);
            job.apply(&patch);

            assert_eq!(job.status, status);
            assert_eq!(job.started_at, Some(now));
            assert_eq!(job.started_at, job.finished_at);
        }
    }

    #[test]
    fn terminal_after_running_keeps_original_start() {
        let mut job = pending_job();
        job.apply(&job.plan_update(&JobUpdate::status(JobStatus::Running), t0()));

        let done = t0() + Duration::minutes(3);
        let update = JobUpdate::status(JobStatus::Succeeded)
            .with_result(json!({"text": "ok"}))
            .with_cost(120);
        job.apply(&job.plan_update(&update, done));

        assert_eq!(job.started_at, Some(t0()));
        assert_eq!(job.finished_at, Some(done));
        assert_eq!(job.cost_tok, Some(120));
        assert_eq!(job.result, Some(json!({"text": "ok"})));
    }

    #[test]
    fn result_only_update_touches_no_timestamps() {
        let job = pending_job();
        let patch = job.plan_update(
            &JobUpdate {
                result: Some(json!({"partial": true})),
                ..Default::default()
            },
            t0(),
        );
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value, json!({"result": {"partial": true}}));
    }

    #[test]
    fn serialized_field_names_match_contract() {
        let mut job = pending_job();
        job.apply(&job.plan_update(&JobUpdate::status(JobStatus::Failed), t0()));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "content-generation");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["createdAt"], "2026-03-01T12:00:00.000Z");
        assert_eq!(value["startedAt"], "2026-03-01T12:00:00.000Z");
        assert!(value.get("tenantId").is_some());
        assert!(value.get("costTok").is_some());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn job_type_parses_wire_names() {
        assert_eq!(
            "lora-training".parse::<JobType>().unwrap(),
            JobType::LoraTraining
        );
        assert!("lora_training".parse::<JobType>().is_err());
    }
}
