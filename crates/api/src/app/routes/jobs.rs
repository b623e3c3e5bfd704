use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use genflow_core::{JobId, JobUpdate};
use genflow_infra::{CreateJob, OrchestrationError};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/series", get(get_series))
        .route("/:id", get(get_job).patch(update_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateJob>,
) -> axum::response::Response {
    match services.jobs.create_job(body).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    match services.jobs.list_jobs(query.filter(), query.pagination()).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

pub async fn get_series(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::SeriesQuery>,
) -> axum::response::Response {
    let window = query.window.unwrap_or_else(|| "24h".to_string());
    match services.analytics.get_series(&window).await {
        Ok(points) => (
            StatusCode::OK,
            Json(serde_json::json!({ "window": window, "points": points })),
        )
            .into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Some(id) = parse_job_id(&id) else {
        return errors::orchestration_error_to_response(OrchestrationError::NotFound);
    };
    match services.jobs.get_job(id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

/// Worker callback.
pub async fn update_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<JobUpdate>,
) -> axum::response::Response {
    let Some(id) = parse_job_id(&id) else {
        return errors::orchestration_error_to_response(OrchestrationError::NotFound);
    };
    match services.jobs.update_job(id, body).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::orchestration_error_to_response(OrchestrationError::NotFound),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

// A malformed id can never match a record; answer exactly like a missing one.
fn parse_job_id(raw: &str) -> Option<JobId> {
    raw.parse().ok()
}
