use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_pipelines))
        .route("/:execution_id", get(get_pipeline))
}

pub async fn list_pipelines(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListPipelinesQuery>,
) -> axum::response::Response {
    match services
        .pipelines
        .list(query.filter(), query.pagination(), query.sort())
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}

pub async fn get_pipeline(
    Extension(services): Extension<Arc<AppServices>>,
    Path(execution_id): Path<String>,
) -> axum::response::Response {
    match services.pipelines.get_by_execution_id(&execution_id).await {
        Ok(execution) => (StatusCode::OK, Json(execution)).into_response(),
        Err(e) => errors::orchestration_error_to_response(e),
    }
}
