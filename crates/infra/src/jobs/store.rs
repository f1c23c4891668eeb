//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use jobforge_core::{Job, JobId, JobStatus, NewJob};

/// Job store abstraction.
///
/// Implementations must be durable enough for the deployment they serve:
/// the worker treats the stored row, never an in-memory copy, as the truth.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Make the store usable (connectivity, schema). Called before serving.
    async fn prepare(&self) -> Result<(), JobStoreError>;

    /// Insert a new PENDING job and return the stored record.
    ///
    /// Fails with `DuplicateKey` when the idempotency key already exists.
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, in `order`, at most `limit` of them.
    async fn scan(
        &self,
        filter: JobFilter,
        order: JobOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Write the mutable fields of `job` if the stored status is still `expected`.
    ///
    /// Returns `false` (and writes nothing) when the row moved on.
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError>;

    async fn count(&self, filter: JobFilter) -> Result<u64, JobStoreError>;

    /// Aggregate statistics, with at most `recent_failures` FAILED jobs.
    async fn stats(&self, recent_failures: usize) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("idempotency key already exists: {0}")]
    DuplicateKey(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Row predicate for scans and counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Only PENDING jobs whose `scheduled_at` is absent or not after this instant.
    pub eligible_at: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            eligible_at: None,
        }
    }

    pub fn eligible(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            eligible_at: Some(now),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s) && self.eligible_at.is_none_or(|now| job.is_eligible(now))
    }
}

/// Scan order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Submission order
    #[default]
    Created,
    /// `priority ASC, created_at ASC`, then submission order
    Selection,
}

/// Job statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    /// Keyed by status name; statuses with no jobs are absent.
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    /// Mean `attempts` over FAILED jobs, 0 when there are none.
    pub avg_attempts_failed: f64,
    /// Most recently finished FAILED jobs first.
    pub recent_failures: Vec<Job>,
}

#[derive(Debug, Default)]
struct Jobs {
    /// Append-only, in submission order.
    rows: Vec<Job>,
    by_id: HashMap<JobId, usize>,
    by_key: HashMap<String, usize>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Jobs>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Jobs>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Jobs>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn prepare(&self) -> Result<(), JobStoreError> {
        self.read().map(|_| ())
    }

    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.by_key.contains_key(&job.idempotency_key) {
            return Err(JobStoreError::DuplicateKey(job.idempotency_key));
        }

        let job = job.into_job(JobId::new(), Utc::now());
        let idx = jobs.rows.len();
        jobs.by_id.insert(job.id, idx);
        jobs.by_key.insert(job.idempotency_key.clone(), idx);
        jobs.rows.push(job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs.by_id.get(&job_id).map(|&idx| jobs.rows[idx].clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs.by_key.get(key).map(|&idx| jobs.rows[idx].clone()))
    }

    async fn scan(
        &self,
        filter: JobFilter,
        order: JobOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<Job> = jobs.rows.iter().filter(|j| filter.matches(j)).cloned().collect();

        if order == JobOrder::Selection {
            // Stable: ties keep submission order.
            result.sort_by_key(|j| (j.priority, j.created_at));
        }
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let idx = *jobs.by_id.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        let row = &mut jobs.rows[idx];

        if row.status != expected {
            return Ok(false);
        }

        row.status = job.status;
        row.attempts = job.attempts;
        row.result = job.result.clone();
        row.error_message = job.error_message.clone();
        row.scheduled_at = job.scheduled_at;
        row.started_at = job.started_at;
        row.finished_at = job.finished_at;
        row.updated_at = job.updated_at;
        Ok(true)
    }

    async fn count(&self, filter: JobFilter) -> Result<u64, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs.rows.iter().filter(|j| filter.matches(j)).count() as u64)
    }

    async fn stats(&self, recent_failures: usize) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        let mut failed: Vec<&Job> = Vec::new();

        for job in &jobs.rows {
            *stats.by_status.entry(job.status.to_string()).or_default() += 1;
            *stats.by_type.entry(job.job_type.clone()).or_default() += 1;
            if job.status == JobStatus::Failed {
                failed.push(job);
            }
        }

        if !failed.is_empty() {
            let total: u64 = failed.iter().map(|j| u64::from(j.attempts)).sum();
            stats.avg_attempts_failed = total as f64 / failed.len() as f64;
        }

        // Newest submission first among equal finish times.
        failed.reverse();
        failed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        stats.recent_failures = failed.into_iter().take(recent_failures).cloned().collect();

        Ok(stats)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn prepare(&self) -> Result<(), JobStoreError> {
        (**self).prepare().await
    }

    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn scan(
        &self,
        filter: JobFilter,
        order: JobOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).scan(filter, order, limit).await
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        (**self).update(job, expected).await
    }

    async fn count(&self, filter: JobFilter) -> Result<u64, JobStoreError> {
        (**self).count(filter).await
    }

    async fn stats(&self, recent_failures: usize) -> Result<JobStats, JobStoreError> {
        (**self).stats(recent_failures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::RetryPolicy;

    fn new_job(key: &str) -> NewJob {
        NewJob::new("send_email", key, serde_json::json!({"to": "ops@example.com"}))
    }

    #[tokio::test]
    async fn insert_assigns_id_and_rejects_duplicate_keys() {
        let store = InMemoryJobStore::new();

        let job = store.insert(new_job("k1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(store.find_by_idempotency_key("k1").await.unwrap(), Some(job));

        let err = store.insert(new_job("k1")).await.unwrap_err();
        assert!(matches!(err, JobStoreError::DuplicateKey(k) if k == "k1"));
        assert_eq!(store.count(JobFilter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_unknown_id_is_none() {
        let store = InMemoryJobStore::new();
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_is_conditional_on_expected_status() {
        let store = InMemoryJobStore::new();
        let mut job = store.insert(new_job("k1")).await.unwrap();
        let now = Utc::now();

        job.begin_attempt(now).unwrap();
        assert!(store.update(&job, JobStatus::Pending).await.unwrap());

        // A second claim based on the stale PENDING view must not apply.
        assert!(!store.update(&job, JobStatus::Pending).await.unwrap());

        job.fail("boom", &RetryPolicy::immediate(), now).unwrap();
        assert!(store.update(&job, JobStatus::Processing).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_message.as_deref(), Some("Attempt 1 failed: boom"));
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let ghost = new_job("ghost").into_job(JobId::new(), Utc::now());
        assert!(matches!(
            store.update(&ghost, JobStatus::Pending).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn selection_scan_orders_by_priority_then_submission() {
        let store = InMemoryJobStore::new();
        for (key, priority) in [("a", 10), ("b", 1), ("c", 5), ("d", 1)] {
            store.insert(new_job(key).with_priority(priority)).await.unwrap();
        }

        let keys: Vec<String> = store
            .scan(JobFilter::all(), JobOrder::Selection, None)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.idempotency_key)
            .collect();
        assert_eq!(keys, ["b", "d", "c", "a"]);

        let created: Vec<String> = store
            .scan(JobFilter::all(), JobOrder::Created, Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.idempotency_key)
            .collect();
        assert_eq!(created, ["a", "b"]);
    }

    #[tokio::test]
    async fn eligible_filter_skips_future_and_non_pending_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store
            .insert(new_job("later").scheduled_at(now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let due = store
            .insert(new_job("due").scheduled_at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let mut running = store.insert(new_job("running")).await.unwrap();
        running.begin_attempt(now).unwrap();
        store.update(&running, JobStatus::Pending).await.unwrap();

        let eligible = store.scan(JobFilter::eligible(now), JobOrder::Selection, None).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, due.id);
        assert_eq!(store.count(JobFilter::with_status(JobStatus::Pending)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let policy = RetryPolicy::immediate();

        for i in 0..3 {
            store.insert(new_job(&format!("mail-{i}"))).await.unwrap();
        }
        for i in 0..2 {
            let mut job = store
                .insert(NewJob::new("test_failure", format!("fail-{i}"), serde_json::json!({})).with_max_attempts(i + 1))
                .await
                .unwrap();
            while job.status == JobStatus::Pending {
                job.begin_attempt(Utc::now()).unwrap();
                store.update(&job, JobStatus::Pending).await.unwrap();
                job.fail("boom", &policy, Utc::now()).unwrap();
                store.update(&job, JobStatus::Processing).await.unwrap();
            }
        }

        let stats = store.stats(10).await.unwrap();
        assert_eq!(stats.by_status.get("PENDING"), Some(&3));
        assert_eq!(stats.by_status.get("FAILED"), Some(&2));
        assert_eq!(stats.by_status.get("COMPLETED"), None);
        assert_eq!(stats.by_type.get("send_email"), Some(&3));
        assert_eq!(stats.by_type.get("test_failure"), Some(&2));
        assert!((stats.avg_attempts_failed - 1.5).abs() < f64::EPSILON);
        assert_eq!(stats.recent_failures.len(), 2);
        assert_eq!(stats.recent_failures[0].idempotency_key, "fail-1");

        assert_eq!(store.stats(1).await.unwrap().recent_failures.len(), 1);
    }
}
