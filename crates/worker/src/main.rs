//! Job worker process: waits for the store, recovers interrupted jobs, then
//! polls and executes until Ctrl-C. Serves `/health` and `/metrics` on
//! `WORKER_METRICS_ADDR`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use jobforge_infra::config::Config;
use jobforge_infra::jobs::BuiltinHandlers;
use jobforge_infra::workers::JobWorker;
use jobforge_observability::JobMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = Config::from_env()?;
    let store = config
        .postgres_store()?
        .context("DATABASE_URL must be set for the worker")?;
    let metrics = JobMetrics::new().context("failed to register metrics")?;

    let metrics_listener = tokio::net::TcpListener::bind(config.worker_metrics_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.worker_metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_listener.local_addr()?);
    let router = metrics_router(metrics.clone());
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, router).await {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    let worker = JobWorker::with_observer(
        Arc::new(store),
        Arc::new(BuiltinHandlers::new(config.handler_settings())),
        config.worker_config("job-worker"),
        Arc::new(metrics),
    );

    // Fatal: never enter the loop without a reachable store.
    let recovered = worker.start().await.context("job store unavailable")?;
    tracing::info!(recovered, "worker starting main loop");

    let handle = worker.spawn();
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested; finishing current job");
    handle.shutdown().await;

    metrics_server.abort();
    Ok(())
}

fn metrics_router(metrics: JobMetrics) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move {
                    match metrics.render() {
                        Ok(body) => (
                            StatusCode::OK,
                            [(header::CONTENT_TYPE, metrics.content_type())],
                            body,
                        )
                            .into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
}
