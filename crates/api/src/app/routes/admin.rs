use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, routing::get, Json, Router};

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/stats", get(stats))
}

/// Counts by status and type, failed-job attempt average, latest failures.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.intake.stats().await {
        Ok(stats) => Json(dto::StatsResponse::from(stats)).into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}
