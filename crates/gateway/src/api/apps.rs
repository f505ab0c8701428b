//! App connection endpoint.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use wsp_sdk::DialError;

use super::api_error;
use crate::apps::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectionQuery {
    #[serde(default)]
    pub signed_token: String,
}

/// `GET /api/v2/workspaceagents/:id/connection?signed_token=..`
pub async fn agent_connection(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
    Query(query): Query<ConnectionQuery>,
) -> Response {
    match state.node.apps().connect(agent_id, &query.signed_token).await {
        Ok(conn) => Json(conn).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                tracing::warn!(agent_id = %agent_id, error = %e, "app connection failed");
            }
            api_error(status, "Failed to connect to workspace agent.", e.to_string())
        }
    }
}

fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        AppError::NoKey => StatusCode::SERVICE_UNAVAILABLE,
        AppError::InvalidKey(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AppError::InvalidToken(_) | AppError::Expired => StatusCode::UNAUTHORIZED,
        AppError::AgentMismatch(_) => StatusCode::FORBIDDEN,
        AppError::Dial(DialError::NotFound(_)) => StatusCode::NOT_FOUND,
        AppError::Dial(DialError::Unauthorized(..)) => StatusCode::FORBIDDEN,
        AppError::Dial(DialError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Dial(DialError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Dial(_) => StatusCode::BAD_GATEWAY,
    }
}
