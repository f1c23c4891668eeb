use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{Job, JobStatus};
use jobforge_infra::jobs::JobStats;

// -------------------------
// Request DTOs
// -------------------------

/// `POST /jobs` body; parsing and validation happen in the intake service.
pub use jobforge_infra::jobs::CreateJob as CreateJobRequest;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: JsonValue,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub scheduled_at: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub result: Option<JsonValue>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type,
            idempotency_key: job.idempotency_key,
            status: job.status,
            priority: job.priority,
            payload: job.payload,
            created_at: timestamp(job.created_at),
            updated_at: timestamp(job.updated_at),
            started_at: job.started_at.map(timestamp),
            finished_at: job.finished_at.map(timestamp),
            scheduled_at: job.scheduled_at.map(timestamp),
            error_message: job.error_message,
            attempts: job.attempts,
            result: job.result,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

#[derive(Debug, Serialize)]
pub struct RecentFailure {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub error: Option<String>,
    pub attempts: u32,
    pub failed_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub status_breakdown: BTreeMap<String, u64>,
    pub type_breakdown: BTreeMap<String, u64>,
    pub avg_attempts_for_failed_jobs: f64,
    pub recent_failures: Vec<RecentFailure>,
}

impl From<JobStats> for StatsResponse {
    fn from(stats: JobStats) -> Self {
        Self {
            status_breakdown: stats.by_status,
            type_breakdown: stats.by_type,
            avg_attempts_for_failed_jobs: stats.avg_attempts_failed,
            recent_failures: stats
                .recent_failures
                .into_iter()
                .map(|job| RecentFailure {
                    job_id: job.id.to_string(),
                    job_type: job.job_type,
                    error: job.error_message,
                    attempts: job.attempts,
                    failed_at: job.finished_at.map(timestamp),
                })
                .collect(),
        }
    }
}

/// ISO-8601 / RFC 3339, UTC, microsecond precision.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
