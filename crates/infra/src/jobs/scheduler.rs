//! Next-job selection and the atomic claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobforge_core::{Job, JobObserver, JobStatus, NoopObserver};

use super::store::{JobFilter, JobOrder, JobStore, JobStoreError};

/// Attempts at claiming before giving up on this poll.
const MAX_CLAIM_RACES: usize = 8;

/// Picks the next eligible job and claims it (PENDING → PROCESSING).
///
/// Order is `priority ASC, created_at ASC`, FIFO within a band. The claim is
/// a conditional write, so two schedulers never hand out the same row.
pub struct Scheduler<S> {
    store: S,
    observer: Arc<dyn JobObserver>,
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Claim the next eligible job, if any. `None` is the normal idle case.
    pub async fn select_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.select_next_at(Utc::now()).await
    }

    /// Like [`select_next`](Self::select_next) with an explicit clock.
    pub async fn select_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        for _ in 0..MAX_CLAIM_RACES {
            let Some(mut job) = self
                .store
                .scan(JobFilter::eligible(now), JobOrder::Selection, Some(1))
                .await?
                .into_iter()
                .next()
            else {
                return Ok(None);
            };

            job.begin_attempt(now)
                .map_err(|e| JobStoreError::Storage(format!("job {} not claimable: {e}", job.id)))?;

            if !self.store.update(&job, JobStatus::Pending).await? {
                debug!(job_id = %job.id, "lost claim race; reselecting");
                continue;
            }

            let queue_wait = job.queue_wait(now);
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                priority = job.priority,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                waited_secs = queue_wait.as_secs_f64(),
                scheduled_at = ?job.scheduled_at,
                "claimed job"
            );
            self.observer.job_claimed(&job.job_type, queue_wait);
            return Ok(Some(job));
        }

        warn!(races = MAX_CLAIM_RACES, "gave up claiming after repeated lost races");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use jobforge_core::NewJob;

    #[tokio::test]
    async fn selects_by_priority_then_fifo() {
        let store = InMemoryJobStore::arc();
        for (key, priority) in [("p10", 10), ("p1", 1), ("p5", 5)] {
            store
                .insert(NewJob::new("send_email", key, json!({})).with_priority(priority))
                .await
                .unwrap();
        }

        let scheduler = Scheduler::new(store.clone());
        let mut order = Vec::new();
        while let Some(job) = scheduler.select_next().await.unwrap() {
            order.push(job.priority);
        }
        assert_eq!(order, [1, 5, 10]);
    }

    #[tokio::test]
    async fn claim_marks_processing_and_counts_the_attempt() {
        let store = InMemoryJobStore::arc();
        let created = store.insert(NewJob::new("send_email", "k", json!({}))).await.unwrap();

        let claimed = Scheduler::new(store.clone()).select_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, created.id);

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 1);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn claimed_job_is_not_selected_again() {
        let store = InMemoryJobStore::arc();
        store.insert(NewJob::new("send_email", "only", json!({}))).await.unwrap();

        let scheduler = Scheduler::new(store);
        assert!(scheduler.select_next().await.unwrap().is_some());
        assert!(scheduler.select_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_schedule_gates_selection() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        let at = now + Duration::minutes(5);
        store
            .insert(NewJob::new("send_email", "later", json!({})).scheduled_at(at))
            .await
            .unwrap();

        let scheduler = Scheduler::new(store);
        assert!(scheduler.select_next_at(now).await.unwrap().is_none());
        assert!(scheduler.select_next_at(at - Duration::seconds(1)).await.unwrap().is_none());
        assert!(scheduler.select_next_at(at).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn competing_schedulers_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        for i in 0..20 {
            store
                .insert(NewJob::new("send_email", format!("k{i}"), json!({})))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let scheduler = Scheduler::new(store.clone());
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = scheduler.select_next().await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(total, 20);
    }
}
