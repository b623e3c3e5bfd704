use axum::{Router, routing::get};

pub mod jobs;
pub mod pipelines;
pub mod system;
pub mod webhooks;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/queues/:type/counts", get(system::queue_counts))
        .nest("/jobs", jobs::router())
        .nest("/pipelines", pipelines::router())
}
