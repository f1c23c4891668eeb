//! Job intake: idempotent creation and read access for clients.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use jobforge_core::{
    DomainError, Job, JobId, JobObserver, JobStatus, NewJob, NoopObserver, parse_timestamp,
};

use super::store::{JobFilter, JobOrder, JobStats, JobStore, JobStoreError};

/// Number of FAILED jobs included in [`JobIntake::stats`].
pub const RECENT_FAILURES_LIMIT: usize = 10;

/// A client submission as received, before parsing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub idempotency_key: String,
    #[serde(default = "empty_object")]
    pub payload: JsonValue,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl CreateJob {
    pub fn new(job_type: impl Into<String>, idempotency_key: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            priority: None,
            scheduled_at: None,
            max_attempts: None,
        }
    }

    /// Parse and validate into a [`NewJob`]. No side effects.
    pub fn parse(self) -> Result<NewJob, DomainError> {
        let mut job = NewJob::new(self.job_type, self.idempotency_key, self.payload);
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = self.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(raw) = self.scheduled_at.as_deref() {
            job = job.scheduled_at(parse_timestamp(raw)?);
        }
        job.validate()?;
        Ok(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<DomainError> for IntakeError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => IntakeError::Validation(msg),
            other => IntakeError::Validation(other.to_string()),
        }
    }
}

/// Client-facing operations over a job store.
pub struct JobIntake<S> {
    store: S,
    observer: Arc<dyn JobObserver>,
}

impl<S: JobStore> JobIntake<S> {
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

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a job, or return the existing one for a repeated idempotency key.
    ///
    /// The existing row is returned unchanged: a resubmission never alters
    /// payload, priority or schedule.
    pub async fn create(&self, request: CreateJob) -> Result<Job, IntakeError> {
        let new_job = request.parse()?;

        if let Some(existing) = self.store.find_by_idempotency_key(&new_job.idempotency_key).await? {
            debug!(job_id = %existing.id, idempotency_key = %existing.idempotency_key, "duplicate submission");
            return Ok(existing);
        }

        let key = new_job.idempotency_key.clone();
        match self.store.insert(new_job).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    priority = job.priority,
                    scheduled_at = ?job.scheduled_at,
                    "job created"
                );
                self.observer.job_created(&job.job_type);
                Ok(job)
            }
            // Lost a race with a concurrent identical submission.
            Err(JobStoreError::DuplicateKey(_)) => self
                .store
                .find_by_idempotency_key(&key)
                .await?
                .ok_or_else(|| {
                    IntakeError::Store(JobStoreError::Storage(format!(
                        "idempotency key {key} collided but no row was found"
                    )))
                }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, IntakeError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(IntakeError::NotFound(job_id))
    }

    /// All jobs, optionally with one status, oldest first.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, IntakeError> {
        let filter = JobFilter {
            status,
            ..JobFilter::all()
        };
        Ok(self.store.scan(filter, JobOrder::Created, None).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, IntakeError> {
        Ok(self.store.stats(RECENT_FAILURES_LIMIT).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    #[derive(Default)]
    struct CountingObserver {
        created: AtomicUsize,
    }

    impl JobObserver for CountingObserver {
        fn job_created(&self, _job_type: &str) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn intake() -> JobIntake<Arc<InMemoryJobStore>> {
        JobIntake::new(InMemoryJobStore::arc())
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let job = intake()
            .create(CreateJob::new("send_email", "k1", json!({"to": "a@b.c"})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.attempts, 0);
        assert!(job.scheduled_at.is_none());
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn resubmission_returns_first_job_unchanged() {
        let observer = Arc::new(CountingObserver::default());
        let intake = intake().with_observer(observer.clone());

        let mut first = CreateJob::new("process_data", "same-key", json!({"data": 1}));
        first.priority = Some(2);
        let mut second = CreateJob::new("process_data", "same-key", json!({"data": 2}));
        second.priority = Some(9);

        let a = intake.create(first).await.unwrap();
        let b = intake.create(second).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.payload, json!({"data": 1}));
        assert_eq!(b.priority, 2);
        assert_eq!(observer.created.load(Ordering::SeqCst), 1);
        assert_eq!(intake.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_schedule_is_rejected_without_side_effects() {
        let intake = intake();
        let mut req = CreateJob::new("send_email", "k-bad", json!({}));
        req.scheduled_at = Some("next tuesday".into());

        let err = intake.create(req).await.unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));
        assert!(intake.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn naive_schedule_is_taken_as_utc() {
        let mut req = CreateJob::new("send_email", "k-sched", json!({}));
        req.scheduled_at = Some("2030-01-30T15:00:00".into());

        let job = intake().create(req).await.unwrap();
        assert_eq!(
            job.scheduled_at.unwrap().to_rfc3339(),
            "2030-01-30T15:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn out_of_range_max_attempts_is_invalid() {
        for max_attempts in [0, 3_000_000_000] {
            let mut req = CreateJob::new("send_email", format!("k{max_attempts}"), json!({}));
            req.max_attempts = Some(max_attempts);
            assert!(matches!(
                intake().create(req).await,
                Err(IntakeError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let id = JobId::new();
        assert!(matches!(intake().get(id).await, Err(IntakeError::NotFound(got)) if got == id));
    }

    #[tokio::test]
    async fn list_filters_by_status_in_creation_order() {
        let intake = intake();
        for key in ["a", "b", "c"] {
            intake
                .create(CreateJob::new("send_email", key, json!({})))
                .await
                .unwrap();
        }

        let mut b = intake.store().find_by_idempotency_key("b").await.unwrap().unwrap();
        b.begin_attempt(chrono::Utc::now()).unwrap();
        assert!(intake.store().update(&b, JobStatus::Pending).await.unwrap());

        let pending: Vec<_> = intake
            .list(Some(JobStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.idempotency_key)
            .collect();
        assert_eq!(pending, ["a", "c"]);

        let processing = intake.list(Some(JobStatus::Processing)).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].idempotency_key, "b");
    }

    #[test]
    fn request_deserializes_with_type_field() {
        let req: CreateJob = serde_json::from_value(json!({
            "type": "test_failure",
            "idempotency_key": "k1",
            "max_attempts": 3
        }))
        .unwrap();

        assert_eq!(req.job_type, "test_failure");
        assert_eq!(req.payload, json!({}));
        assert_eq!(req.max_attempts, Some(3));
    }
}
