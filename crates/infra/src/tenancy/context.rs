use std::cell::RefCell;
use std::future::Future;

use genflow_core::{DomainError, TenantId, UserId};

tokio::task_local! {
    static CONTEXT: RefCell<RequestContext>;
}

/// Caller identity for one logical request.
///
/// Lives in a task-local slot established by [`RequestContext::scope`]; code
/// further down the call chain reads it with [`RequestContext::get`] instead of
/// threading a parameter through every layer. Never persisted.
///
/// Spawned tasks do not inherit the scope. Re-scope explicitly when handing
/// work to `tokio::spawn`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub role: Option<String>,
}

impl RequestContext {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Overwrite the fields that `fields` carries; absent fields are kept.
    pub fn merge(&mut self, fields: RequestContext) {
        if fields.tenant_id.is_some() {
            self.tenant_id = fields.tenant_id;
        }
        if fields.user_id.is_some() {
            self.user_id = fields.user_id;
        }
        if fields.email.is_some() {
            self.email = fields.email;
        }
        if fields.role.is_some() {
            self.role = fields.role;
        }
    }

    /// Run `fut` inside a fresh context seeded from the enclosing one (if any)
    /// merged with `fields`. Changes made inside never leak outwards.
    pub async fn scope<F>(fields: RequestContext, fut: F) -> F::Output
    where
        F: Future,
    {
        let mut seeded = Self::get();
        seeded.merge(fields);
        CONTEXT.scope(RefCell::new(seeded), fut).await
    }

    /// Merge `fields` into the active context.
    ///
    /// Returns `false` (and changes nothing) when called outside a scope.
    pub fn set(fields: RequestContext) -> bool {
        let applied = CONTEXT
            .try_with(|ctx| ctx.borrow_mut().merge(fields))
            .is_ok();
        if !applied {
            tracing::debug!("request context set outside of a scope; ignored");
        }
        applied
    }

    /// Snapshot of the active context, or the empty context.
    pub fn get() -> RequestContext {
        CONTEXT
            .try_with(|ctx| ctx.borrow().clone())
            .unwrap_or_default()
    }

    pub fn current_tenant() -> Option<TenantId> {
        CONTEXT.try_with(|ctx| ctx.borrow().tenant_id).ok().flatten()
    }

    pub fn require_tenant() -> Result<TenantId, DomainError> {
        Self::current_tenant().ok_or(DomainError::Unauthorized)
    }
}
