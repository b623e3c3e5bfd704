use std::sync::{Arc, Mutex};

use genflow_infra::{
    AppConfig, DryRunProcessor, InMemoryQueue, InMemoryRecordStore, JobProcessor, JobService,
    JobServiceConfig, OutcomeAggregator, PipelineTracker, QueueConsumer, QueueSet, QueueWorker,
    RecordStore, ScopedStore, WorkerConfig, WorkerHandle,
};

#[cfg(feature = "redis")]
use genflow_infra::{PostgresRecordStore, queue::RedisStreamsQueue};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Type-erased record store shared by every service.
pub type DynStore = Arc<dyn RecordStore>;
/// Type-erased queue handle (one per job type).
pub type DynQueue = Arc<dyn QueueConsumer>;

/// Which backends the services are wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Persistent,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::InMemory => "in-memory",
            Backend::Persistent => "postgres+redis",
        }
    }
}

pub struct AppServices {
    pub jobs: JobService<DynStore, DynQueue>,
    pub pipelines: PipelineTracker<DynStore>,
    pub analytics: OutcomeAggregator<DynStore>,
    backend: Backend,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    fn new(store: DynStore, queues: QueueSet<DynQueue>, config: &AppConfig, backend: Backend) -> Self {
        let store = Arc::new(ScopedStore::new(store));
        Self {
            jobs: JobService::new(store.clone(), queues, JobServiceConfig::from(config)),
            pipelines: PipelineTracker::new(store.clone()),
            analytics: OutcomeAggregator::new(store),
            backend,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// In-memory store and queues, no workers attached.
    pub fn in_memory(config: &AppConfig) -> Self {
        let store: DynStore = Arc::new(InMemoryRecordStore::new());
        let queues = QueueSet::from_fn(|job_type| Arc::new(InMemoryQueue::new(job_type.as_str())) as DynQueue);
        Self::new(store, queues, config, Backend::InMemory)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Start one local worker per job type, consuming with `processor`.
    pub fn spawn_workers(&self, processor: Arc<dyn JobProcessor>, config: &AppConfig) {
        let handles: Vec<_> = self
            .jobs
            .queues()
            .iter()
            .map(|(job_type, _)| {
                let worker_config = WorkerConfig::default()
                    .with_name(format!("local-{job_type}"))
                    .with_poll_interval(config.worker_poll_interval);
                QueueWorker::new(self.jobs.clone(), job_type, processor.clone(), worker_config).spawn()
            })
            .collect();

        match self.workers.lock() {
            Ok(mut workers) => workers.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or_default()
    }

    /// Stop every local worker and wait for its loop to exit.
    pub async fn shutdown_workers(&self) {
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// Wire services from configuration.
///
/// Postgres + Redis when both URLs are set and the `redis` feature is enabled;
/// otherwise in-memory with local dry-run workers draining the queues.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let use_persistent = config.database_url.is_some() && config.redis_url.is_some();

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("DATABASE_URL and REDIS_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    let services = AppServices::in_memory(config);
    services.spawn_workers(Arc::new(DryRunProcessor), config);
    tracing::info!(
        backend = services.backend().as_str(),
        workers = services.worker_count(),
        "services ready"
    );
    Ok(services)
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    use anyhow::Context;

    let database_url = config.database_url.as_deref().context("DATABASE_URL not set")?;
    let redis_url = config.redis_url.as_deref().context("REDIS_URL not set")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = PostgresRecordStore::new(pool);
    store.migrate().await.context("failed to apply record store schema")?;

    let queues = QueueSet::try_from_fn(|job_type| {
        RedisStreamsQueue::new(redis_url, job_type.as_str(), config.queue_timeout)
            .map(|queue| Arc::new(queue.with_claim_idle(config.queue_claim_idle)) as DynQueue)
    })
    .context("failed to open redis queues")?;

    let store: DynStore = Arc::new(store);
    let services = AppServices::new(store, queues, config, Backend::Persistent);
    tracing::info!(backend = services.backend().as_str(), "services ready");
    Ok(services)
}
