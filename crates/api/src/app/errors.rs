use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobforge_infra::jobs::IntakeError;

pub fn intake_error_to_response(err: IntakeError) -> axum::response::Response {
    match err {
        IntakeError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        IntakeError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "Job not found"),
        IntakeError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
