pub mod apps;
pub mod health;
pub mod relay;

use axum::extract::{Request, State};
use axum::http::header::{HOST, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use wsp_protocol::BUILD_VERSION_HEADER;

use crate::state::AppState;

/// Build the proxy's HTTP surface.
///
/// Everything is public: relay peers authenticate with the mesh key and app
/// traffic with signed app tokens, both checked in their handlers.
pub fn router(state: AppState) -> Router<AppState> {
    let version = HeaderValue::from_str(&state.node.build_info().version)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

    Router::new()
        // Health
        .route("/healthz", get(health::healthz))
        .route("/healthz-report", get(health::healthz_report))
        .route("/api/v2/buildinfo", get(health::build_info))
        // Relay
        .route("/derp", get(relay::relay_ws))
        .route("/derp/latency-check", get(relay::latency_check))
        .route("/latency-check", get(relay::latency_check))
        // Apps
        .route(
            "/api/v2/workspaceagents/:id/connection",
            get(apps::agent_connection),
        )
        .fallback(fallback)
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            let version = version.clone();
            async move {
                let mut resp = next.run(req).await;
                let headers = resp.headers_mut();
                headers.insert(BUILD_VERSION_HEADER, version);
                headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
                resp
            }
        }))
}

/// Build a standardized JSON error response: `{ "message": .., "detail": .. }`.
pub(crate) fn api_error(
    status: StatusCode,
    message: impl Into<String>,
    detail: impl Into<String>,
) -> Response {
    let body = wsp_protocol::ApiErrorResponse {
        message: message.into(),
        detail: detail.into(),
    };
    (status, Json(body)).into_response()
}

/// Anything not served by the proxy.  Subdomain app hosts get a 404; every
/// other request is pointed at the dashboard.
async fn fallback(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if let Some(app) = state.node.apps().subdomain_app(host) {
        return api_error(
            StatusCode::NOT_FOUND,
            format!("Application {app:?} not found on this workspace proxy."),
            "Subdomain applications are served through the app connection endpoint.",
        );
    }

    let dashboard = state.node.dashboard_url();
    api_error(
        StatusCode::BAD_REQUEST,
        "Workspace Proxies route traffic in terminals and apps and do not support the Coder dashboard. Please use the dashboard instead.",
        format!("Head to the dashboard at {dashboard}"),
    )
}
