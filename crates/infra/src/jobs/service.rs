use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument};

use genflow_core::{
    Job, JobId, JobStatus, JobType, JobUpdate, Page, Pagination, timestamp,
};

use crate::config::AppConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::queue::{DeliveryOptions, JobQueue, QueueCounts, QueueSet, QueueTask, RetryPolicy};
use crate::store::{Filter, OrderBy, RecordStore, ScopedStore, typed};
use crate::tenancy::RequestContext;

use super::dry_run;

/// Dispatch settings applied to every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobServiceConfig {
    pub retry: RetryPolicy,
    /// Used when a request names no priority.
    pub default_priority: u8,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_priority: 5,
        }
    }
}

impl From<&AppConfig> for JobServiceConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            retry: cfg.retry_policy(),
            default_priority: cfg.job_default_priority,
        }
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJob {
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

impl CreateJob {
    pub fn new(job_type: JobType, payload: JsonValue) -> Self {
        Self {
            job_type,
            payload,
            priority: None,
            dry_run: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = Some(true);
        self
    }

    /// Explicit flag, or `"dryRun": true` inside the payload.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run.unwrap_or(false) || dry_run::requested_in(&self.payload)
    }
}

/// List filters for jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct JobFilter {
    #[serde(default, rename = "type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

impl JobFilter {
    fn to_filter(self) -> Filter {
        let mut filter = Filter::new();
        if let Some(t) = self.job_type {
            filter = filter.eq("type", t.as_str());
        }
        if let Some(s) = self.status {
            filter = filter.eq("status", s.as_str());
        }
        filter
    }
}

/// Owns `Job` records: creation, dispatch and status-driven updates.
///
/// All persistence goes through the tenant-scoped store, so the caller's
/// tenant (if any) is applied without being passed explicitly.
pub struct JobService<S, Q> {
    store: Arc<ScopedStore<S>>,
    queues: Arc<QueueSet<Q>>,
    config: JobServiceConfig,
}

impl<S, Q> Clone for JobService<S, Q> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queues: self.queues.clone(),
            config: self.config,
        }
    }
}

impl<S, Q> JobService<S, Q>
where
    S: RecordStore,
    Q: JobQueue,
{
    pub fn new(store: Arc<ScopedStore<S>>, queues: QueueSet<Q>, config: JobServiceConfig) -> Self {
        Self {
            store,
            queues: Arc::new(queues),
            config,
        }
    }

    pub fn queues(&self) -> &QueueSet<Q> {
        &self.queues
    }

    pub fn config(&self) -> &JobServiceConfig {
        &self.config
    }

    /// Persist a new job and either complete it as a dry run or dispatch it.
    ///
    /// A dispatch failure leaves the persisted job `pending` and surfaces as
    /// `UpstreamDispatchFailure` carrying its id.
    #[instrument(skip(self, request), fields(job_type = %request.job_type), err)]
    pub async fn create_job(&self, request: CreateJob) -> OrchestrationResult<Job> {
        let dry_run = request.is_dry_run();
        let tenant = RequestContext::current_tenant();
        let job = Job::new(tenant, request.job_type, request.payload, timestamp::now());
        let job = typed::create(&*self.store, &job).await?;

        info!(job_id = %job.id, tenant_id = ?tenant, dry_run, "job created");

        if dry_run {
            let update = JobUpdate::status(JobStatus::Succeeded)
                .with_result(dry_run::mock_result(job.job_type, &job.payload))
                .with_cost(0);
            return self.reconcile(job, &update).await;
        }

        let options = DeliveryOptions::new(
            request.priority.unwrap_or(self.config.default_priority),
            self.config.retry,
        );
        let task = QueueTask {
            job_id: job.id,
            payload: job.payload.clone(),
        };

        match self.queues.get(job.job_type).enqueue(task, options).await {
            Ok(message_id) => {
                info!(job_id = %job.id, message_id = %message_id, priority = options.priority, "job dispatched");
                Ok(job)
            }
            Err(source) => {
                error!(job_id = %job.id, error = %source, "job dispatch failed; job left pending");
                Err(OrchestrationError::UpstreamDispatchFailure {
                    job_id: job.id,
                    source,
                })
            }
        }
    }

    /// Partial update (worker callback). `None` when the job does not exist
    /// or belongs to another tenant.
    #[instrument(skip(self, update), fields(job_id = %id), err)]
    pub async fn update_job(&self, id: JobId, update: JobUpdate) -> OrchestrationResult<Option<Job>> {
        match self.find(id).await? {
            Some(job) => self.reconcile(job, &update).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_job(&self, id: JobId) -> OrchestrationResult<Job> {
        self.find(id).await?.ok_or(OrchestrationError::NotFound)
    }

    /// Newest first.
    pub async fn list_jobs(&self, filter: JobFilter, pagination: Pagination) -> OrchestrationResult<Page<Job>> {
        let filter = filter.to_filter();
        let total = typed::count::<Job, _>(&*self.store, filter.clone()).await?;
        let items = typed::find_many(
            &*self.store,
            filter,
            Some(OrderBy::desc("createdAt")),
            Some(pagination),
        )
        .await?;
        Ok(Page::new(items, total, pagination))
    }

    pub async fn queue_counts(&self, job_type: JobType) -> OrchestrationResult<QueueCounts> {
        Ok(self.queues.get(job_type).counts().await?)
    }

    async fn find(&self, id: JobId) -> OrchestrationResult<Option<Job>> {
        Ok(typed::find_unique(&*self.store, Filter::new().eq("id", id.to_string())).await?)
    }

    async fn reconcile(&self, job: Job, update: &JobUpdate) -> OrchestrationResult<Job> {
        let patch = job.plan_update(update, timestamp::now());
        if patch.is_empty() {
            return Ok(job);
        }
        let updated = typed::update::<Job, _, _>(&*self.store, Filter::new().eq("id", job.id.to_string()), &patch)
            .await?
            .ok_or(OrchestrationError::NotFound)?;

        if patch.status.is_some() {
            info!(job_id = %updated.id, status = %updated.status, "job status changed");
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BackoffKind, InMemoryQueue, QueueError};
    use crate::store::InMemoryRecordStore;
    use genflow_core::TenantId;
    use serde_json::json;

    type Service = JobService<Arc<InMemoryRecordStore>, Arc<InMemoryQueue>>;

    fn service() -> (Service, QueueSet<Arc<InMemoryQueue>>) {
        let store = Arc::new(ScopedStore::new(Arc::new(InMemoryRecordStore::new())));
        let queues = QueueSet::from_fn(|t| Arc::new(InMemoryQueue::new(t.as_str())));
        let svc = JobService::new(store, queues.clone(), JobServiceConfig::default());
        (svc, queues)
    }

    fn in_tenant<F: std::future::Future>(tenant: TenantId, fut: F) -> impl std::future::Future<Output = F::Output> {
        RequestContext::scope(RequestContext::for_tenant(tenant), fut)
    }

    #[tokio::test]
    async fn content_job_is_dispatched_once_with_default_retry_policy() {
        let (svc, queues) = service();
        let job = in_tenant(
            TenantId::new(),
            svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({"prompt": "hi"}))),
        )
        .await
        .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        let sent = queues.get(JobType::ContentGeneration).messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].task, QueueTask { job_id: job.id, payload: json!({"prompt": "hi"}) });
        assert_eq!(sent[0].options.attempts, 3);
        assert_eq!(sent[0].options.backoff.kind, BackoffKind::Exponential);
        assert_eq!(sent[0].options.backoff.delay_ms, 5000);
        assert_eq!(sent[0].options.priority, 5);

        for t in [JobType::ImageGeneration, JobType::LoraTraining, JobType::VideoGeneration] {
            assert!(queues.get(t).messages().is_empty());
        }
    }

    #[tokio::test]
    async fn dry_run_completes_without_enqueueing() {
        let (svc, queues) = service();
        let tenant = TenantId::new();

        for request in [
            CreateJob::new(JobType::ImageGeneration, json!({})).dry_run(),
            CreateJob::new(JobType::VideoGeneration, json!({"dryRun": true})),
        ] {
            let job = in_tenant(tenant, svc.create_job(request)).await.unwrap();
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.cost_tok, Some(0));
            assert!(job.started_at.is_some());
            assert_eq!(job.started_at, job.finished_at);
            assert_eq!(job.result.as_ref().map(|r| r["dryRun"].clone()), Some(json!(true)));
        }

        for (_, q) in queues.iter() {
            assert!(q.messages().is_empty());
        }
    }

    #[tokio::test]
    async fn priority_is_clamped() {
        let (svc, queues) = service();
        in_tenant(
            TenantId::new(),
            svc.create_job(CreateJob::new(JobType::LoraTraining, json!({})).with_priority(0)),
        )
        .await
        .unwrap();
        assert_eq!(queues.get(JobType::LoraTraining).messages()[0].options.priority, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_keeps_the_job_pending() {
        let (svc, queues) = service();
        queues.get(JobType::VideoGeneration).close();
        let tenant = TenantId::new();

        let err = in_tenant(tenant, svc.create_job(CreateJob::new(JobType::VideoGeneration, json!({}))))
            .await
            .unwrap_err();
        let OrchestrationError::UpstreamDispatchFailure { job_id, source } = err else {
            panic!("expected dispatch failure, got {err:?}");
        };
        assert_eq!(source, QueueError::Closed);

        let job = in_tenant(tenant, svc.get_job(job_id)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_update_without_running_backfills_started_at() {
        let (svc, _) = service();
        let tenant = TenantId::new();
        let job = in_tenant(tenant, svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({}))))
            .await
            .unwrap();

        let done = in_tenant(
            tenant,
            svc.update_job(job.id, JobUpdate::status(JobStatus::Failed).with_result(json!({"error": "x"}))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.finished_at.is_some());
        assert_eq!(done.started_at, done.finished_at);
    }

    #[tokio::test]
    async fn running_then_succeeded_keeps_the_original_start() {
        let (svc, _) = service();
        let tenant = TenantId::new();
        let job = in_tenant(tenant, svc.create_job(CreateJob::new(JobType::ImageGeneration, json!({}))))
            .await
            .unwrap();

        let running = in_tenant(tenant, svc.update_job(job.id, JobUpdate::status(JobStatus::Running)))
            .await
            .unwrap()
            .unwrap();
        let started = running.started_at;
        assert!(started.is_some());

        let done = in_tenant(
            tenant,
            svc.update_job(job.id, JobUpdate::status(JobStatus::Succeeded).with_cost(42)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(done.started_at, started);
        assert_eq!(done.cost_tok, Some(42));
        assert!(done.finished_at >= started);
    }

    #[tokio::test]
    async fn tenants_only_see_their_own_jobs() {
        let (svc, _) = service();
        let (a, b) = (TenantId::new(), TenantId::new());

        let job_a = in_tenant(a, svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({}))))
            .await
            .unwrap();
        in_tenant(b, svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({}))))
            .await
            .unwrap();

        let page = in_tenant(b, svc.list_jobs(JobFilter::default(), Pagination::default()))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items.iter().all(|j| j.tenant_id == Some(b)));

        let foreign = in_tenant(b, svc.get_job(job_a.id)).await.unwrap_err();
        let missing = in_tenant(b, svc.get_job(JobId::new())).await.unwrap_err();
        assert!(matches!(foreign, OrchestrationError::NotFound));
        assert_eq!(foreign.to_string(), missing.to_string());

        let update = in_tenant(b, svc.update_job(job_a.id, JobUpdate::status(JobStatus::Running)))
            .await
            .unwrap();
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_type_and_status_newest_first() {
        let (svc, _) = service();
        let tenant = TenantId::new();
        in_tenant(tenant, async {
            svc.create_job(CreateJob::new(JobType::ImageGeneration, json!({"n": 1}))).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
            svc.create_job(CreateJob::new(JobType::ImageGeneration, json!({"n": 2}))).await.unwrap();
            svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({})).dry_run()).await.unwrap();
        })
        .await;

        let images = in_tenant(
            tenant,
            svc.list_jobs(
                JobFilter { job_type: Some(JobType::ImageGeneration), status: None },
                Pagination::default(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(images.total, 2);
        assert_eq!(images.items[0].payload, json!({"n": 2}));

        let succeeded = in_tenant(
            tenant,
            svc.list_jobs(
                JobFilter { job_type: None, status: Some(JobStatus::Succeeded) },
                Pagination::default(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(succeeded.total, 1);
    }

    #[tokio::test]
    async fn queue_counts_reflect_waiting_tasks() {
        let (svc, _) = service();
        in_tenant(TenantId::new(), svc.create_job(CreateJob::new(JobType::LoraTraining, json!({}))))
            .await
            .unwrap();
        let counts = svc.queue_counts(JobType::LoraTraining).await.unwrap();
        assert_eq!(counts, QueueCounts { active: 0, waiting: 1, failed: 0 });
    }
}
