//! The job record and its state machine.
//!
//! ## Lifecycle
//!
//! ```text
//!            claim                 handler ok
//! PENDING ──────────▶ PROCESSING ────────────▶ COMPLETED
//!    ▲                  │    │
//!    │  retry / crash   │    │ failure, attempts >= max_attempts
//!    └──────────────────┘    └─────────────────────────────────▶ FAILED
//! ```
//!
//! COMPLETED and FAILED are terminal: every transition method refuses to
//! touch a terminal job, so `status`, `result`, `error_message` and
//! `finished_at` are frozen once set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::retry::RetryPolicy;

/// Priority assigned when the client does not send one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Attempt ceiling assigned when the client does not send one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Highest `max_attempts` a client may ask for.
pub const MAX_ATTEMPTS_CEILING: u32 = 100;

/// Length limits, in characters.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_JOB_TYPE_LEN: usize = 100;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be selected (possibly not yet eligible, see `scheduled_at`)
    Pending,
    /// Claimed by a worker, handler running
    Processing,
    /// Handler returned a result
    Completed,
    /// Exhausted `max_attempts`
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(DomainError::validation(format!(
                "status must be one of: PENDING, PROCESSING, COMPLETED, FAILED (got '{s}')"
            ))),
        }
    }
}

/// A validated submission, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            scheduled_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Make the job ineligible before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency_key must not be empty"));
        }
        if self.idempotency_key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("type must not be empty"));
        }
        if self.job_type.chars().count() > MAX_JOB_TYPE_LEN {
            return Err(DomainError::validation(format!(
                "type must be at most {MAX_JOB_TYPE_LEN} characters"
            )));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.max_attempts > MAX_ATTEMPTS_CEILING {
            return Err(DomainError::validation(format!(
                "max_attempts must be at most {MAX_ATTEMPTS_CEILING}"
            )));
        }
        if !self.payload.is_object() {
            return Err(DomainError::validation("payload must be a JSON object"));
        }
        Ok(())
    }

    /// Materialize the stored record. Called by stores on insert.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            idempotency_key: self.idempotency_key,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            attempts: 0,
            max_attempts: self.max_attempts,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A unit of work and its execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Attempts that reached the execution engine (including interrupted ones)
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a failed attempt did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to PENDING; eligible again at `retry_at` (immediately when `None`).
    Retrying {
        attempt: u32,
        max_attempts: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Moved to FAILED.
    Exhausted { attempts: u32 },
}

impl Job {
    /// PENDING and past its `scheduled_at` (if any).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Sort key for selection: priority, then FIFO within a priority band.
    ///
    /// The id is a final tie-break for jobs created within the same instant.
    pub fn selection_key(&self) -> (i32, DateTime<Utc>, JobId) {
        (self.priority, self.created_at, self.id)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Time between submission and `now`, clamped at zero.
    pub fn queue_wait(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// PENDING → PROCESSING: stamp `started_at` and count the attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PROCESSING → COMPLETED.
    pub fn complete(&mut self, result: JsonValue, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PROCESSING → PENDING (retry) or FAILED (budget exhausted).
    ///
    /// A non-final failure records `"Attempt {n} failed: {error}"`; the final
    /// one records the raw error.
    pub fn fail(
        &mut self,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureOutcome> {
        if self.has_attempts_left() {
            self.transition(JobStatus::Pending)?;
            self.error_message = Some(format!("Attempt {} failed: {}", self.attempts, error));
            self.updated_at = now;

            let delay = policy.delay_for_attempt(self.attempts);
            let retry_at = if delay.is_zero() {
                None
            } else {
                let at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                self.scheduled_at = Some(at);
                Some(at)
            };

            Ok(FailureOutcome::Retrying {
                attempt: self.attempts,
                max_attempts: self.max_attempts,
                retry_at,
            })
        } else {
            self.transition(JobStatus::Failed)?;
            self.error_message = Some(error.to_string());
            self.finished_at = Some(now);
            self.updated_at = now;
            Ok(FailureOutcome::Exhausted {
                attempts: self.attempts,
            })
        }
    }

    /// PROCESSING → PENDING after the worker that claimed it died.
    ///
    /// `attempts` is left alone: the interrupted attempt counts.
    pub fn requeue_interrupted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Pending)?;
        self.updated_at = now;
        Ok(())
    }

    /// PROCESSING → FAILED for an interrupted attempt that was the last one
    /// allowed. Requeueing it would push `attempts` past `max_attempts`.
    pub fn abandon_interrupted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(format!(
            "Attempt {} of {} was interrupted before its outcome was recorded",
            self.attempts, self.max_attempts
        ));
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Settle an interrupted attempt: requeue while budget remains, fail
    /// otherwise.
    pub fn settle_interrupted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.has_attempts_left() {
            self.requeue_interrupted(now)
        } else {
            self.abandon_interrupted(now)
        }
    }

    fn transition(&mut self, to: JobStatus) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::Terminal(self.status));
        }
        if !self.status.can_transition_to(to) {
            return Err(DomainError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
