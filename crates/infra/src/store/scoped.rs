use async_trait::async_trait;

use crate::tenancy::{RequestContext, TenantScope};

use super::{Operation, Outcome, RecordStore, StoreError};

/// Record store wrapper that applies tenant isolation to every operation.
///
/// The tenant is read from the active [`RequestContext`] at execution time,
/// so callers never pass it explicitly.
#[derive(Debug, Clone)]
pub struct ScopedStore<S> {
    inner: S,
    scope: TenantScope,
}

impl<S> ScopedStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_scope(inner, TenantScope::default())
    }

    pub fn with_scope(inner: S, scope: TenantScope) -> Self {
        Self { inner, scope }
    }

    /// The wrapped store, bypassing tenant isolation.
    pub fn unscoped(&self) -> &S {
        &self.inner
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }
}

#[async_trait]
impl<S> RecordStore for ScopedStore<S>
where
    S: RecordStore,
{
    async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError> {
        let op = self.scope.apply(model, RequestContext::current_tenant(), op);
        self.inner.execute(model, op).await
    }
}
