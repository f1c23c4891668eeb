use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobforge_infra::config::Config;
use jobforge_infra::jobs::{BuiltinHandlers, InMemoryJobStore, JobIntake, JobStore};
use jobforge_infra::workers::{JobWorker, JobWorkerHandle};
use jobforge_observability::JobMetrics;

/// Shared state behind every route.
pub struct AppServices {
    pub intake: JobIntake<Arc<dyn JobStore>>,
    pub metrics: JobMetrics,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, metrics: JobMetrics) -> Self {
        let intake = JobIntake::new(store).with_observer(Arc::new(metrics.clone()));
        Self { intake, metrics }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.intake.store()
    }
}

/// Wire services from configuration.
///
/// Without `DATABASE_URL` jobs live in memory and a worker runs inside this
/// process (its handle is returned so the caller can stop it). With a
/// database the worker is a separate binary.
pub async fn build_services(config: &Config) -> anyhow::Result<(AppServices, Option<JobWorkerHandle>)> {
    let metrics = JobMetrics::new().context("failed to register metrics")?;

    match config.postgres_store()? {
        Some(pg) => {
            let store: Arc<dyn JobStore> = Arc::new(pg);
            store.prepare().await.context("failed to prepare job store")?;
            info!("using postgres job store");
            Ok((AppServices::new(store, metrics), None))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory job store with an embedded worker");
            let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
            let worker = JobWorker::with_observer(
                store.clone(),
                Arc::new(BuiltinHandlers::new(config.handler_settings())),
                config.worker_config("embedded-worker"),
                Arc::new(metrics.clone()),
            );
            worker.start().await.context("embedded worker failed to start")?;
            let handle = worker.spawn();
            Ok((AppServices::new(store, metrics), Some(handle)))
        }
    }
}
