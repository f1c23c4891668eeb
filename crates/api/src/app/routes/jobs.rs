use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use jobforge_core::{JobId, JobStatus};

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/:id", get(get_job))
}

/// Create a job, or return the existing one for a known idempotency key.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    match services.intake.create(body).await {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.intake.get(job_id).await {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

/// `?status=` filters by one of PENDING, PROCESSING, COMPLETED, FAILED.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
    };

    match services.intake.list(status).await {
        Ok(jobs) => Json(dto::JobListResponse {
            jobs: jobs.into_iter().map(dto::JobResponse::from).collect(),
        })
        .into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}
