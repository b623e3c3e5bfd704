//! In-process queue worker.
//!
//! Stands in for the out-of-process generation workers in dev mode and tests:
//! reserves a task, marks the job `running`, invokes a [`JobProcessor`], then
//! reports the outcome through the same update path the worker callback uses.
//! Failures are retried with the message's backoff until its attempts are
//! exhausted, after which the job is marked `failed`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use genflow_core::{JobStatus, JobType, JobUpdate};

use crate::error::OrchestrationResult;
use crate::queue::{QueueConsumer, QueueMessage, QueueTask};
use crate::store::RecordStore;

use super::dry_run;
use super::service::JobService;

/// Output of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub result: JsonValue,
    pub cost_tok: i64,
}

/// Performs the actual work for a task.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job_type: JobType, task: &QueueTask) -> Result<ProcessOutput, String>;
}

/// Processor that fabricates dry-run results instantly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunProcessor;

#[async_trait]
impl JobProcessor for DryRunProcessor {
    async fn process(&self, job_type: JobType, task: &QueueTask) -> Result<ProcessOutput, String> {
        Ok(ProcessOutput {
            result: dry_run::mock_result(job_type, &task.payload),
            cost_tok: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll an empty queue
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            name: "queue-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub uptime_secs: u64,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "queue worker task panicked");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Consumes one job type's queue.
pub struct QueueWorker<S, Q> {
    service: JobService<S, Q>,
    job_type: JobType,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, Q> QueueWorker<S, Q>
where
    S: RecordStore + 'static,
    Q: QueueConsumer + 'static,
{
    pub fn new(
        service: JobService<S, Q>,
        job_type: JobType,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            service,
            job_type,
            processor,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Process at most one task. Returns whether a task was handled.
    ///
    /// A reserved task is always settled: if recording its outcome fails, it
    /// is retried with backoff (or dead-lettered once attempts run out) before
    /// the error is returned.
    pub async fn run_once(&self) -> OrchestrationResult<bool> {
        let queue = self.service.queues().get(self.job_type);
        let Some(message) = queue.reserve().await? else {
            return Ok(false);
        };
        debug!(
            worker = %self.config.name,
            job_id = %message.task.job_id,
            attempt = message.attempts_made,
            "reserved task"
        );

        if let Err(e) = self.handle(queue, &message).await {
            self.release(queue, &message, &e.to_string()).await;
            return Err(e);
        }

        self.record(|s| s.tasks_processed += 1);
        Ok(true)
    }

    async fn handle(&self, queue: &Q, message: &QueueMessage) -> OrchestrationResult<()> {
        let job_id = message.task.job_id;

        if self
            .service
            .update_job(job_id, JobUpdate::status(JobStatus::Running))
            .await?
            .is_none()
        {
            warn!(worker = %self.config.name, job_id = %job_id, "task references an unknown job; dropping");
            queue.fail(message, "job not found").await?;
            self.record(|s| s.tasks_failed += 1);
            return Ok(());
        }

        match self.processor.process(self.job_type, &message.task).await {
            Ok(output) => {
                self.service
                    .update_job(
                        job_id,
                        JobUpdate::status(JobStatus::Succeeded)
                            .with_result(output.result)
                            .with_cost(output.cost_tok),
                    )
                    .await?;
                queue.complete(message).await?;
                self.record(|s| s.tasks_succeeded += 1);
            }
            Err(reason) => {
                let policy = message.options.retry_policy();
                if policy.should_retry(message.attempts_made) {
                    let delay = policy.delay_for_attempt(message.attempts_made);
                    warn!(
                        worker = %self.config.name,
                        job_id = %job_id,
                        attempt = message.attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "task failed; retrying"
                    );
                    queue.retry_later(message, delay).await?;
                    self.record(|s| s.tasks_retried += 1);
                } else {
                    warn!(worker = %self.config.name, job_id = %job_id, error = %reason, "task failed; attempts exhausted");
                    self.service
                        .update_job(
                            job_id,
                            JobUpdate::status(JobStatus::Failed).with_result(json!({ "error": reason })),
                        )
                        .await?;
                    queue.fail(message, &reason).await?;
                    self.record(|s| s.tasks_failed += 1);
                }
            }
        }
        Ok(())
    }

    /// Settle a message whose handling hit an infrastructure error.
    async fn release(&self, queue: &Q, message: &QueueMessage, reason: &str) {
        let job_id = message.task.job_id;
        let policy = message.options.retry_policy();

        let settled = if policy.should_retry(message.attempts_made) {
            let delay = policy.delay_for_attempt(message.attempts_made);
            warn!(worker = %self.config.name, job_id = %job_id, error = %reason, "task errored; retrying");
            self.record(|s| s.tasks_retried += 1);
            queue.retry_later(message, delay).await
        } else {
            warn!(worker = %self.config.name, job_id = %job_id, error = %reason, "task errored; attempts exhausted");
            let failed = JobUpdate::status(JobStatus::Failed).with_result(json!({ "error": reason }));
            if let Err(e) = self.service.update_job(job_id, failed).await {
                error!(worker = %self.config.name, job_id = %job_id, error = %e, "could not mark job failed");
            }
            self.record(|s| s.tasks_failed += 1);
            queue.fail(message, reason).await
        };

        if let Err(e) = settled {
            error!(worker = %self.config.name, job_id = %job_id, error = %e, "could not settle task");
        }
    }

    /// Run the worker loop on the tokio runtime until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();

        let join = tokio::spawn(async move {
            info!(worker = %self.config.name, job_type = %self.job_type, "queue worker started");
            let started = Instant::now();

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                self.record(|s| s.uptime_secs = started.elapsed().as_secs());

                let idle = match self.run_once().await {
                    Ok(handled) => !handled,
                    Err(e) => {
                        error!(worker = %self.config.name, error = %e, "queue worker iteration failed");
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }

            info!(worker = %self.config.name, "queue worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            update(&mut s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CreateJob, JobServiceConfig};
    use crate::queue::{InMemoryQueue, JobQueue, QueueCounts, QueueSet, RetryPolicy};
    use crate::error::OrchestrationError;
    use crate::store::{InMemoryRecordStore, Operation, OperationKind, Outcome, ScopedStore, StoreError};
    use crate::tenancy::RequestContext;
    use genflow_core::TenantId;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    type Service = JobService<Arc<InMemoryRecordStore>, Arc<InMemoryQueue>>;

    fn service(retry: RetryPolicy) -> Service {
        let store = Arc::new(ScopedStore::new(Arc::new(InMemoryRecordStore::new())));
        let queues = QueueSet::from_fn(|t| Arc::new(InMemoryQueue::new(t.as_str())));
        JobService::new(
            store,
            queues,
            JobServiceConfig {
                retry,
                default_priority: 5,
            },
        )
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for Flaky {
        async fn process(&self, _: JobType, _: &QueueTask) -> Result<ProcessOutput, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(format!("boom {n}"))
            } else {
                Ok(ProcessOutput {
                    result: json!({"ok": true}),
                    cost_tok: 7,
                })
            }
        }
    }

    async fn create(svc: &Service, tenant: TenantId, job_type: JobType) -> genflow_core::Job {
        RequestContext::scope(
            RequestContext::for_tenant(tenant),
            svc.create_job(CreateJob::new(job_type, json!({"prompt": "p"}))),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn successful_task_completes_the_job() {
        let svc = service(RetryPolicy::default());
        let tenant = TenantId::new();
        let job = create(&svc, tenant, JobType::ContentGeneration).await;

        let worker = QueueWorker::new(
            svc.clone(),
            JobType::ContentGeneration,
            Arc::new(DryRunProcessor),
            WorkerConfig::default(),
        );
        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let done = svc.get_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.cost_tok, Some(0));
        assert!(done.started_at.is_some() && done.finished_at.is_some());
        assert_eq!(worker.stats().tasks_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_with_backoff_then_mark_the_job_failed() {
        let svc = service(RetryPolicy::exponential(2, Duration::from_millis(100)));
        let job = create(&svc, TenantId::new(), JobType::ImageGeneration).await;

        let worker = QueueWorker::new(
            svc.clone(),
            JobType::ImageGeneration,
            Arc::new(Flaky {
                failures: u32::MAX,
                calls: AtomicU32::new(0),
            }),
            WorkerConfig::default(),
        );

        assert!(worker.run_once().await.unwrap());
        assert_eq!(svc.get_job(job.id).await.unwrap().status, JobStatus::Running);
        // Backoff not yet elapsed.
        assert!(!worker.run_once().await.unwrap());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(worker.run_once().await.unwrap());

        let failed = svc.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.result, Some(json!({"error": "boom 1"})));

        let queue = svc.queues().get(JobType::ImageGeneration);
        assert_eq!(queue.counts().await.unwrap(), QueueCounts { active: 0, waiting: 0, failed: 1 });
        let stats = worker.stats();
        assert_eq!((stats.tasks_retried, stats.tasks_failed, stats.tasks_processed), (1, 1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn a_retry_can_still_succeed() {
        let svc = service(RetryPolicy::exponential(3, Duration::from_millis(10)));
        let job = create(&svc, TenantId::new(), JobType::VideoGeneration).await;
        let worker = QueueWorker::new(
            svc.clone(),
            JobType::VideoGeneration,
            Arc::new(Flaky {
                failures: 1,
                calls: AtomicU32::new(0),
            }),
            WorkerConfig::default(),
        );

        worker.run_once().await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        worker.run_once().await.unwrap();

        let done = svc.get_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.cost_tok, Some(7));
    }

    /// Rejects every `Update` while `broken` is set.
    struct BrokenUpdates {
        inner: InMemoryRecordStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for BrokenUpdates {
        async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError> {
            if self.broken.load(Ordering::SeqCst) && op.kind() == OperationKind::Update {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.execute(model, op).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_never_strand_a_reserved_task() {
        let backend = Arc::new(BrokenUpdates {
            inner: InMemoryRecordStore::new(),
            broken: AtomicBool::new(true),
        });
        let svc = JobService::new(
            Arc::new(ScopedStore::new(backend.clone())),
            QueueSet::from_fn(|t| Arc::new(InMemoryQueue::new(t.as_str()))),
            JobServiceConfig {
                retry: RetryPolicy::exponential(2, Duration::from_millis(50)),
                default_priority: 5,
            },
        );
        let job = RequestContext::scope(
            RequestContext::for_tenant(TenantId::new()),
            svc.create_job(CreateJob::new(JobType::ContentGeneration, json!({}))),
        )
        .await
        .unwrap();

        let worker = QueueWorker::new(
            svc.clone(),
            JobType::ContentGeneration,
            Arc::new(DryRunProcessor),
            WorkerConfig::default(),
        );
        let queue = svc.queues().get(JobType::ContentGeneration);

        assert!(matches!(worker.run_once().await, Err(OrchestrationError::Store(_))));
        assert_eq!(queue.counts().await.unwrap(), QueueCounts { active: 0, waiting: 1, failed: 0 });

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(worker.run_once().await.is_err());
        assert_eq!(queue.counts().await.unwrap(), QueueCounts { active: 0, waiting: 0, failed: 1 });
        assert!(!worker.run_once().await.unwrap());

        backend.broken.store(false, Ordering::SeqCst);
        assert_eq!(svc.get_job(job.id).await.unwrap().status, JobStatus::Pending);
        let stats = worker.stats();
        assert_eq!((stats.tasks_retried, stats.tasks_failed), (1, 1));
    }

    #[tokio::test]
    async fn spawned_worker_drains_the_queue_and_shuts_down() {
        let svc = service(RetryPolicy::default());
        let job = create(&svc, TenantId::new(), JobType::LoraTraining).await;

        let handle = QueueWorker::new(
            svc.clone(),
            JobType::LoraTraining,
            Arc::new(DryRunProcessor),
            WorkerConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .spawn();

        let mut status = JobStatus::Pending;
        for _ in 0..200 {
            status = svc.get_job(job.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(handle.stats().tasks_succeeded, 1);
        handle.shutdown().await;
    }
}
