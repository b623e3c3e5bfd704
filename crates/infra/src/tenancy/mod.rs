//! Tenant isolation: the request-scoped tenant context and the rules that
//! rewrite persistence operations against tenant-owned models.

pub mod context;
pub mod scope;

pub use context::RequestContext;
pub use scope::{TENANT_FIELD, TENANT_OWNED_MODELS, TenantScope};
