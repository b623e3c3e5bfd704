use std::sync::Arc;

use anyhow::Context;

use genflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genflow_observability::init();

    let config = AppConfig::from_env();
    let services = Arc::new(genflow_api::app::services::build_services(&config).await?);
    let app = genflow_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    services.shutdown_workers().await;
    Ok(())
}
