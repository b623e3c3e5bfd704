use axum::{http::StatusCode, middleware::Next, response::Response};

use genflow_infra::RequestContext;

use crate::app::errors;
use crate::context;

/// Establish the tenant context for the rest of the request.
///
/// Everything downstream (handlers, services, the scoped store) runs inside
/// the task-local scope opened here.
pub async fn tenant_context(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let ctx = match context::from_headers(req.headers()) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::debug!(error = %e.message(), "rejecting request without tenant context");
            return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.message());
        }
    };

    RequestContext::scope(ctx, next.run(req)).await
}
