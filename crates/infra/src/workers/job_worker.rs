use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::{JobId, JobObserver, JobStatus, NoopObserver, RetryPolicy};

use crate::jobs::{
    ExecutorError, JobExecutor, JobFilter, JobHandler, JobStore, JobStoreError, Recovery, Scheduler,
};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Name for logging
    pub name: String,
    /// Idle sleep between polls
    pub poll_interval: Duration,
    /// Store readiness attempts before giving up
    pub startup_max_retries: u32,
    /// Fixed delay between readiness attempts
    pub startup_retry_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            startup_max_retries: 10,
            startup_retry_delay: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.startup_max_retries = max_retries;
        self.startup_retry_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store not ready after {attempts} attempts: {source}")]
    StartupExhausted {
        attempts: u32,
        #[source]
        source: JobStoreError,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Execution(#[from] ExecutorError),
}

/// Handle to stop a spawned worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for the current iteration to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "job worker task ended abnormally");
        }
    }
}

/// Single cooperative polling loop: select → run → observe.
///
/// One job at a time; the loop only sleeps when there was nothing to run.
pub struct JobWorker<S> {
    store: S,
    scheduler: Scheduler<S>,
    executor: JobExecutor<S>,
    recovery: Recovery<S>,
    observer: Arc<dyn JobObserver>,
    config: JobWorkerConfig,
}

impl<S: JobStore + Clone + 'static> JobWorker<S> {
    pub fn new(store: S, handler: Arc<dyn JobHandler>, config: JobWorkerConfig) -> Self {
        Self::with_observer(store, handler, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        store: S,
        handler: Arc<dyn JobHandler>,
        config: JobWorkerConfig,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()).with_observer(observer.clone()),
            executor: JobExecutor::new(store.clone(), handler)
                .with_retry_policy(config.retry.clone())
                .with_observer(observer.clone()),
            recovery: Recovery::new(store.clone()),
            store,
            observer,
            config,
        }
    }

    /// Wait for the store, then reconcile interrupted jobs.
    ///
    /// Retries a bounded number of times with a fixed delay. Returns the
    /// number of recovered jobs. The loop must not run if this fails.
    pub async fn start(&self) -> Result<u64, WorkerError> {
        let max = self.config.startup_max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ready = match self.store.prepare().await {
                Ok(()) => self.recovery.reconcile().await,
                Err(err) => Err(err),
            };

            match ready {
                Ok(recovered) => {
                    info!(worker = %self.config.name, attempt, "job store ready");
                    return Ok(recovered);
                }
                Err(err) if attempt < max => {
                    warn!(
                        worker = %self.config.name,
                        attempt,
                        max_attempts = max,
                        error = %err,
                        "job store not ready; retrying"
                    );
                    tokio::time::sleep(self.config.startup_retry_delay).await;
                }
                Err(err) => {
                    error!(worker = %self.config.name, attempts = attempt, error = %err, "job store never became ready");
                    return Err(WorkerError::StartupExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// One iteration. Returns whether a job was run.
    ///
    /// A claimed job whose outcome could not be recorded is released before
    /// the error is returned, so it never stays PROCESSING behind a live
    /// worker.
    pub async fn tick(&self) -> Result<bool, WorkerError> {
        let ran = match self.scheduler.select_next().await? {
            Some(job) => {
                let job_id = job.id;
                if let Err(err) = self.executor.run(job).await {
                    self.release(job_id, &err).await;
                    return Err(err.into());
                }
                true
            }
            None => {
                debug!(worker = %self.config.name, "no jobs ready to process");
                false
            }
        };
        self.refresh_queue_depth().await?;
        Ok(ran)
    }

    async fn release(&self, job_id: JobId, cause: &ExecutorError) {
        match self.recovery.release(job_id).await {
            Ok(true) => warn!(
                worker = %self.config.name,
                job_id = %job_id,
                error = %cause,
                "job outcome not recorded; released claim"
            ),
            Ok(false) => {}
            Err(err) => error!(
                worker = %self.config.name,
                job_id = %job_id,
                error = %err,
                "could not release claim; job stays PROCESSING until the next startup"
            ),
        }
    }

    async fn refresh_queue_depth(&self) -> Result<(), WorkerError> {
        let pending = self.store.count(JobFilter::with_status(JobStatus::Pending)).await?;
        let processing = self.store.count(JobFilter::with_status(JobStatus::Processing)).await?;
        self.observer.queue_depth(pending, processing);
        Ok(())
    }

    /// Loop until `shutdown` flips to `true`.
    ///
    /// Shutdown is honored between iterations, never mid-job. A failing
    /// iteration is logged and counted; the loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "job worker started");
        self.observer.worker_up(true);

        while !*shutdown.borrow() {
            let idle = match self.tick().await {
                Ok(ran) => !ran,
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "worker iteration failed");
                    self.observer.loop_fault();
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // Sender gone: nobody can stop us any more, so stop now.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.observer.worker_up(false);
        info!(worker = %self.config.name, "job worker stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        JobWorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use async_trait::async_trait;
    use jobforge_core::{Job, JobId, NewJob};
    use serde_json::json;

    use super::*;
    use crate::jobs::{BuiltinHandlers, HandlerSettings, InMemoryJobStore, JobOrder, JobStats};

    /// Delegates to the in-memory store; can be switched to fail every call,
    /// or to fail the next few writes that expect PROCESSING.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        down: AtomicBool,
        prepare_calls: AtomicU32,
        failing_outcome_writes: AtomicU32,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), JobStoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(JobStoreError::Storage("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn prepare(&self) -> Result<(), JobStoreError> {
            self.prepare_calls.fetch_add(1, Ordering::SeqCst);
            self.check()
        }
        async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
            self.check()?;
            self.inner.insert(job).await
        }
        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.check()?;
            self.inner.get(job_id).await
        }
        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
            self.check()?;
            self.inner.find_by_idempotency_key(key).await
        }
        async fn scan(
            &self,
            filter: JobFilter,
            order: JobOrder,
            limit: Option<usize>,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.check()?;
            self.inner.scan(filter, order, limit).await
        }
        async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
            self.check()?;
            if expected == JobStatus::Processing
                && self
                    .failing_outcome_writes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(JobStoreError::Storage("blip".into()));
            }
            self.inner.update(job, expected).await
        }
        async fn count(&self, filter: JobFilter) -> Result<u64, JobStoreError> {
            self.check()?;
            self.inner.count(filter).await
        }
        async fn stats(&self, recent_failures: usize) -> Result<JobStats, JobStoreError> {
            self.check()?;
            self.inner.stats(recent_failures).await
        }
    }

    #[derive(Default)]
    struct Recorder {
        pending: AtomicU64,
        faults: AtomicU64,
        up: AtomicBool,
    }

    impl JobObserver for Recorder {
        fn queue_depth(&self, pending: u64, _processing: u64) {
            self.pending.store(pending, Ordering::SeqCst);
        }
        fn worker_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }
        fn loop_fault(&self) {
            self.faults.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler() -> Arc<dyn JobHandler> {
        Arc::new(BuiltinHandlers::new(HandlerSettings::instant()))
    }

    fn config() -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_startup_retries(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_failure_job_fails_after_three_cycles() {
        let store = InMemoryJobStore::arc();
        let job = store
            .insert(NewJob::new("test_failure", "k1", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        let worker = JobWorker::new(store.clone(), handler(), config());
        worker.start().await.unwrap();

        for _ in 0..3 {
            assert!(worker.tick().await.unwrap());
        }

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(!worker.tick().await.unwrap());
    }

    #[tokio::test]
    async fn tick_reports_queue_depth() {
        let store = InMemoryJobStore::arc();
        for key in ["a", "b"] {
            store.insert(NewJob::new("send_email", key, json!({}))).await.unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let worker = JobWorker::with_observer(store, handler(), config(), recorder.clone());

        worker.tick().await.unwrap();
        assert_eq!(recorder.pending.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_retries_then_gives_up() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let worker = JobWorker::new(store.clone(), handler(), config());

        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, WorkerError::StartupExhausted { attempts: 3, .. }));
        assert_eq!(store.prepare_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn startup_recovers_stuck_jobs() {
        let store = InMemoryJobStore::arc();
        store.insert(NewJob::new("send_email", "s", json!({}))).await.unwrap();
        Scheduler::new(store.clone()).select_next().await.unwrap();

        let worker = JobWorker::new(store, handler(), config());
        assert_eq!(worker.start().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn crash_on_final_attempt_never_exceeds_max_attempts() {
        let store = InMemoryJobStore::arc();
        let job = store
            .insert(NewJob::new("test_failure", "k1", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        let worker = JobWorker::new(store.clone(), handler(), config());
        worker.tick().await.unwrap();
        worker.tick().await.unwrap();

        // Third attempt claimed, then the process dies before running it.
        Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();

        let restarted = JobWorker::new(store.clone(), handler(), config());
        assert_eq!(restarted.start().await.unwrap(), 1);
        assert!(!restarted.tick().await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.attempts <= stored.max_attempts);
    }

    #[tokio::test]
    async fn transient_outcome_write_failure_is_retried() {
        let store = Arc::new(FlakyStore::default());
        let job = store
            .insert(NewJob::new("send_email", "blip", json!({"to": "x"})))
            .await
            .unwrap();
        store.failing_outcome_writes.store(1, Ordering::SeqCst);
        let worker = JobWorker::new(store.clone(), handler(), config());

        assert!(worker.tick().await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn unrecorded_outcome_releases_the_claim() {
        let store = Arc::new(FlakyStore::default());
        let job = store
            .insert(NewJob::new("send_email", "lost", json!({"to": "x"})))
            .await
            .unwrap();
        // Enough failures to exhaust the executor's own write retries.
        store.failing_outcome_writes.store(3, Ordering::SeqCst);
        let worker = JobWorker::new(store.clone(), handler(), config());

        assert!(matches!(
            worker.tick().await,
            Err(WorkerError::Execution(ExecutorError::Store(_)))
        ));
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);

        // Store healthy again: the same worker picks it back up.
        assert!(worker.tick().await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn loop_survives_store_faults_and_stops_on_shutdown() {
        let store = Arc::new(FlakyStore::default());
        let job = store
            .insert(NewJob::new("send_email", "later", json!({"to": "x"})))
            .await
            .unwrap();
        store.down.store(true, Ordering::SeqCst);

        let recorder = Arc::new(Recorder::default());
        let handle = JobWorker::with_observer(store.clone(), handler(), config(), recorder.clone()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.faults.load(Ordering::SeqCst) >= 1);
        assert!(recorder.up.load(Ordering::SeqCst));

        store.down.store(false, Ordering::SeqCst);
        let mut done = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get(job.id).await.unwrap().unwrap().status == JobStatus::Completed {
                done = true;
                break;
            }
        }
        assert!(done, "job never completed after the store came back");

        handle.shutdown().await;
        assert!(!recorder.up.load(Ordering::SeqCst));
    }
}
