//! Inbound workflow-engine webhooks.
//!
//! These are not behind the header middleware: the tenant comes from the
//! body, and the context is established from it before anything else runs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use genflow_infra::RequestContext;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/pipelines", post(create_pipeline))
        .route("/pipelines/progress", post(update_progress))
}

pub async fn create_pipeline(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreatePipelineRequest>,
) -> axum::response::Response {
    let ctx = RequestContext::for_tenant(body.tenant_id);
    match RequestContext::scope(ctx, services.pipelines.create(body)).await {
        Ok(execution) => (StatusCode::CREATED, Json(execution)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

pub async fn update_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::PipelineProgressRequest>,
) -> axum::response::Response {
    let ctx = RequestContext::for_tenant(body.tenant_id);
    let update = services.pipelines.update_progress(&body.execution_id, body.updates);
    match RequestContext::scope(ctx, update).await {
        Ok(execution) => (StatusCode::OK, Json(execution)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}
