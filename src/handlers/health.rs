use axum::{extract::State, http::StatusCode, Json};

use crate::models::api::HealthResponse;
use crate::AppState;

/// GET /health
///
/// - 200: every dependency answered within its deadline
/// - 503: at least one probe failed; `checks` says which
pub async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.health.check().await;
    let (status, label) = if report.healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            checks: report.checks,
        }),
    )
}
