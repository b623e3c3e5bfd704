//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (record store, queues, workers)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: query/body DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Protected routes: tenant context from the gateway's identity headers.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn(middleware::tenant_context));

    // Webhooks carry their tenant in the body.
    let webhooks = routes::webhooks::router().layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", webhooks)
        .merge(protected)
}
