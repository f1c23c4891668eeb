//! Execution engine: runs a claimed job and applies the retry ladder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use jobforge_core::{
    DomainError, FailureOutcome, Job, JobObserver, JobStatus, NoopObserver, RetryPolicy,
};

use super::handlers::{HandlerError, JobHandler};
use super::store::{JobStore, JobStoreError};

/// Writes of an attempt's outcome before the error is handed to the caller.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What one `run` did to the stored job.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        duration: Duration,
    },
    /// Back to PENDING for another attempt.
    Retrying {
        attempt: u32,
        max_attempts: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Retry budget exhausted.
    Failed {
        attempts: u32,
    },
    /// Nothing written: the job was not PROCESSING, or the stored row moved
    /// on while the handler ran.
    Skipped,
}

/// Runs claimed jobs through a [`JobHandler`].
///
/// Every outcome is a conditional write against the stored row (expected
/// PROCESSING); the in-memory `Job` is never treated as authoritative.
pub struct JobExecutor<S> {
    store: S,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    observer: Arc<dyn JobObserver>,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(store: S, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            store,
            handler,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Execute one attempt of a job already claimed by the scheduler.
    pub async fn run(&self, mut job: Job) -> Result<RunOutcome, ExecutorError> {
        if job.status != JobStatus::Processing {
            warn!(job_id = %job.id, status = %job.status, "refusing to run unclaimed job");
            return Ok(RunOutcome::Skipped);
        }

        let started = Instant::now();
        let outcome = self.invoke(&job).await;
        let duration = started.elapsed();
        let now = Utc::now();

        match outcome {
            Ok(result) => {
                job.complete(result, now)?;
                if !self.persist(&job).await? {
                    return Ok(RunOutcome::Skipped);
                }
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    duration_secs = duration.as_secs_f64(),
                    "job completed"
                );
                self.observer.job_completed(&job.job_type, duration);
                Ok(RunOutcome::Completed { duration })
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    duration_secs = duration.as_secs_f64(),
                    error = %message,
                    "job attempt failed"
                );

                let failure = job.fail(&message, &self.retry, now)?;
                if !self.persist(&job).await? {
                    return Ok(RunOutcome::Skipped);
                }

                match failure {
                    FailureOutcome::Retrying {
                        attempt,
                        max_attempts,
                        retry_at,
                    } => {
                        info!(
                            job_id = %job.id,
                            attempt,
                            max_attempts,
                            retry_at = ?retry_at,
                            "job will retry"
                        );
                        self.observer.job_retried(&job.job_type);
                        Ok(RunOutcome::Retrying {
                            attempt,
                            max_attempts,
                            retry_at,
                        })
                    }
                    FailureOutcome::Exhausted { attempts } => {
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts,
                            error = %message,
                            "job failed; max attempts exceeded"
                        );
                        self.observer.job_failed(&job.job_type, duration);
                        Ok(RunOutcome::Failed { attempts })
                    }
                }
            }
        }
    }

    /// Run the handler on its own task so a panic fails the attempt instead
    /// of the worker.
    async fn invoke(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let handler = Arc::clone(&self.handler);
        let job_type = job.job_type.clone();
        let payload = job.payload.clone();

        match tokio::spawn(async move { handler.handle(&job_type, &payload).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(HandlerError::Panicked(join_err.to_string())),
        }
    }

    /// Conditional write of the outcome, retried on store errors.
    async fn persist(&self, job: &Job) -> Result<bool, ExecutorError> {
        let mut attempt = 1;
        let written = loop {
            match self.store.update(job, JobStatus::Processing).await {
                Ok(written) => break written,
                Err(err) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        error = %err,
                        "failed to record job outcome; retrying"
                    );
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        if !written {
            warn!(
                job_id = %job.id,
                intended = %job.status,
                "stored job is no longer PROCESSING; dropping outcome"
            );
        }
        Ok(written)
    }
}
