//! Liveness, self-diagnosis and build metadata.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use wsp_protocol::BuildInfoResponse;

use crate::health::{HealthOutcome, SHUTTING_DOWN_MESSAGE};
use crate::state::AppState;

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "OK"
}

/// `GET /healthz-report`: always 200 with the report, except while the
/// node is shutting down.
pub async fn healthz_report(State(state): State<AppState>) -> Response {
    match state.node.health().check_health().await {
        HealthOutcome::ShuttingDown => {
            (StatusCode::INTERNAL_SERVER_ERROR, SHUTTING_DOWN_MESSAGE).into_response()
        }
        HealthOutcome::Report(report) => Json(report).into_response(),
    }
}

/// `GET /api/v2/buildinfo`
pub async fn build_info(State(state): State<AppState>) -> Json<BuildInfoResponse> {
    let build = state.node.build_info();
    Json(BuildInfoResponse {
        external_url: build.external_url.clone(),
        version: build.version.clone(),
        dashboard_url: state.node.dashboard_url().to_string(),
        workspace_proxy: true,
    })
}
