//! Time-bucketed job outcome series.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::instrument;

use genflow_core::{Job, SeriesPoint, Window, timestamp};

use crate::error::OrchestrationResult;
use crate::store::{Filter, RecordStore, ScopedStore, typed};

/// Folds job history into fixed-cadence success/failure counts.
///
/// Reads through the tenant-scoped store: with a tenant in context only that
/// tenant's jobs are counted.
pub struct OutcomeAggregator<S> {
    store: Arc<ScopedStore<S>>,
}

impl<S> Clone for OutcomeAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> OutcomeAggregator<S>
where
    S: RecordStore,
{
    pub fn new(store: Arc<ScopedStore<S>>) -> Self {
        Self { store }
    }

    /// Series for `window` (e.g. `"3h"`) ending at the current time.
    pub async fn get_series(&self, window: &str) -> OrchestrationResult<Vec<SeriesPoint>> {
        self.series_at(window, Utc::now()).await
    }

    /// Series for `window` ending at `now`: exactly `amount` ascending buckets.
    #[instrument(skip(self), err)]
    pub async fn series_at(&self, window: &str, now: DateTime<Utc>) -> OrchestrationResult<Vec<SeriesPoint>> {
        let window = Window::parse(window)?;
        let (from, to) = window.range(now)?;

        let filter = Filter::new().range(
            "createdAt",
            Some(JsonValue::String(timestamp::format(&from))),
            Some(JsonValue::String(timestamp::format(&to))),
        );
        let jobs: Vec<Job> = typed::find_many(&*self.store, filter, None, None).await?;

        Ok(window.tally(now, jobs.into_iter().map(|j| (j.created_at, j.status)))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::store::InMemoryRecordStore;
    use crate::tenancy::RequestContext;
    use chrono::{Duration, TimeZone};
    use genflow_core::{JobStatus, JobType, TenantId};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 14, 37, 12).unwrap()
    }

    async fn seed(store: &InMemoryRecordStore, tenant: TenantId, at: DateTime<Utc>, status: JobStatus) {
        let mut job = Job::new(Some(tenant), JobType::ContentGeneration, json!({}), at);
        job.status = status;
        typed::create(store, &job).await.unwrap();
    }

    fn aggregator(backend: Arc<InMemoryRecordStore>) -> OutcomeAggregator<Arc<InMemoryRecordStore>> {
        OutcomeAggregator::new(Arc::new(ScopedStore::new(backend)))
    }

    #[tokio::test]
    async fn empty_history_yields_zero_filled_hour_buckets() {
        let agg = aggregator(Arc::new(InMemoryRecordStore::new()));
        let series = agg.series_at("3h", now()).await.unwrap();

        let starts: Vec<_> = series.iter().map(|p| p.timestamp).collect();
        assert_eq!(
            starts,
            vec![
                Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 4, 10, 13, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 4, 10, 14, 0, 0).unwrap(),
            ]
        );
        assert!(series.iter().all(|p| p.success == 0 && p.failed == 0));
    }

    #[tokio::test]
    async fn malformed_window_is_rejected() {
        let agg = aggregator(Arc::new(InMemoryRecordStore::new()));
        let err = agg.series_at("5x", now()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidWindow(_)));
    }

    #[tokio::test]
    async fn outcomes_land_in_their_buckets_for_the_context_tenant_only() {
        let backend = Arc::new(InMemoryRecordStore::new());
        let (a, b) = (TenantId::new(), TenantId::new());
        let base = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();

        seed(&backend, a, base + Duration::minutes(5), JobStatus::Succeeded).await;
        seed(&backend, a, base + Duration::minutes(50), JobStatus::Completed).await;
        seed(&backend, a, base + Duration::minutes(65), JobStatus::Failed).await;
        seed(&backend, a, base + Duration::minutes(140), JobStatus::Running).await;
        seed(&backend, a, base - Duration::minutes(1), JobStatus::Failed).await;
        seed(&backend, b, base + Duration::minutes(10), JobStatus::Failed).await;

        let agg = aggregator(backend);
        let series = RequestContext::scope(RequestContext::for_tenant(a), agg.series_at("3h", now()))
            .await
            .unwrap();

        let counts: Vec<_> = series.iter().map(|p| (p.success, p.failed)).collect();
        assert_eq!(counts, vec![(2, 0), (0, 1), (0, 0)]);
    }
}
