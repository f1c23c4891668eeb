//! Startup reconciliation of jobs interrupted by a crash.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use jobforge_core::{Job, JobId, JobStatus};

use super::store::{JobFilter, JobOrder, JobStore, JobStoreError};

/// Resets PROCESSING jobs left behind by a dead worker back to PENDING.
///
/// Must run before the worker loop starts. `attempts` is kept, so the
/// interrupted attempt counts against the retry budget; a job interrupted on
/// its last allowed attempt goes to FAILED instead.
pub struct Recovery<S> {
    store: S,
}

impl<S: JobStore> Recovery<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns how many jobs were settled (requeued or failed).
    pub async fn reconcile(&self) -> Result<u64, JobStoreError> {
        let stuck = self
            .store
            .scan(JobFilter::with_status(JobStatus::Processing), JobOrder::Created, None)
            .await?;

        let now = Utc::now();
        let mut recovered = 0u64;
        for job in stuck {
            if self.settle(job, now).await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(count = recovered, "recovered {recovered} stuck jobs from previous crash");
        } else {
            info!("no stuck jobs found; clean startup");
        }
        Ok(recovered)
    }

    /// Settle one job the running worker could not finish recording.
    ///
    /// Returns `false` when the job is no longer PROCESSING.
    pub async fn release(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        match self.store.get(job_id).await? {
            Some(job) if job.status == JobStatus::Processing => self.settle(job, Utc::now()).await,
            _ => Ok(false),
        }
    }

    async fn settle(&self, mut job: Job, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        if job.settle_interrupted(now).is_err() {
            return Ok(false);
        }
        let written = self.store.update(&job, JobStatus::Processing).await?;
        if written && job.status == JobStatus::Failed {
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                "interrupted job had no attempts left; marked FAILED"
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::scheduler::Scheduler;
    use crate::jobs::store::InMemoryJobStore;
    use jobforge_core::NewJob;

    #[tokio::test]
    async fn stuck_job_is_requeued_with_attempts_kept() {
        let store = InMemoryJobStore::arc();
        let created = store.insert(NewJob::new("send_email", "stuck", json!({}))).await.unwrap();
        store.insert(NewJob::new("send_email", "waiting", json!({}))).await.unwrap();

        // Simulate a worker dying after the claim.
        Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();

        assert_eq!(Recovery::new(store.clone()).reconcile().await.unwrap(), 1);

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);

        let next = Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();
        assert_eq!(next.id, created.id);
        assert_eq!(next.attempts, 2);
    }

    #[tokio::test]
    async fn crash_on_final_attempt_fails_the_job() {
        let store = InMemoryJobStore::arc();
        let created = store
            .insert(NewJob::new("test_failure", "last", json!({})).with_max_attempts(1))
            .await
            .unwrap();

        // The only allowed attempt is claimed, then the worker dies.
        Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();

        assert_eq!(Recovery::new(store.clone()).reconcile().await.unwrap(), 1);

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.attempts <= stored.max_attempts);
        assert!(stored.finished_at.is_some());
        assert!(stored.error_message.unwrap().contains("interrupted"));
        assert!(Scheduler::new(store).select_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_settles_a_single_processing_job() {
        let store = InMemoryJobStore::arc();
        let created = store.insert(NewJob::new("send_email", "r", json!({}))).await.unwrap();
        let recovery = Recovery::new(store.clone());

        // Not claimed yet: nothing to release.
        assert!(!recovery.release(created.id).await.unwrap());

        Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();
        assert!(recovery.release(created.id).await.unwrap());

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn clean_start_recovers_nothing() {
        let store = InMemoryJobStore::arc();
        store.insert(NewJob::new("send_email", "p", json!({}))).await.unwrap();
        assert_eq!(Recovery::new(store).reconcile().await.unwrap(), 0);
    }
}
