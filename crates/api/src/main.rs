use anyhow::Context;
use std::sync::Arc;

use jobforge_infra::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = Config::from_env()?;
    let (services, embedded_worker) = jobforge_api::app::services::build_services(&config).await?;
    let app = jobforge_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.api_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api_bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    if let Some(worker) = embedded_worker {
        worker.shutdown().await;
    }
    Ok(())
}
