use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use genflow_infra::OrchestrationError;

pub fn orchestration_error_to_response(err: OrchestrationError) -> axum::response::Response {
    match err {
        OrchestrationError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        OrchestrationError::Unauthorized => {
            json_error(StatusCode::UNAUTHORIZED, "unauthorized", "no tenant in request context")
        }
        OrchestrationError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        OrchestrationError::InvalidWindow(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_window", msg),
        OrchestrationError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        OrchestrationError::UpstreamDispatchFailure { job_id, source } => (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({
                "error": "upstream_dispatch_failure",
                "message": source.to_string(),
                "jobId": job_id,
            })),
        )
            .into_response(),
        OrchestrationError::Queue(e) => {
            tracing::error!(error = %e, "queue call failed");
            json_error(StatusCode::BAD_GATEWAY, "queue_unavailable", e.to_string())
        }
        OrchestrationError::Store(e) => {
            tracing::error!(error = %e, "record store call failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
