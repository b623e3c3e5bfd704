use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use genflow_core::JobType;
use genflow_infra::RequestContext;

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami() -> impl IntoResponse {
    let ctx = RequestContext::get();
    Json(serde_json::json!({
        "tenantId": ctx.tenant_id,
        "userId": ctx.user_id,
        "email": ctx.email,
        "role": ctx.role,
    }))
}

pub async fn queue_counts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_type): Path<String>,
) -> axum::response::Response {
    let job_type: JobType = match job_type.parse() {
        Ok(t) => t,
        Err(e) => return errors::json_error(StatusCode::NOT_FOUND, "unknown_queue", e.to_string()),
    };

    match services.jobs.queue_counts(job_type).await {
        Ok(counts) => (
            StatusCode::OK,
            Json(serde_json::json!({ "queue": job_type, "counts": counts })),
        )
            .into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}
