//! Relay websocket endpoint and latency probes.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;
use wsp_protocol::RELAY_MESH_KEY_HEADER;

use super::api_error;
use crate::relay::ConnKind;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    /// Peer id for frame routing; generated when absent.
    pub id: Option<Uuid>,
}

/// `GET /derp`
///
/// A request carrying `X-Relay-Mesh-Key` is a sibling replica joining the
/// mesh and must present the installed key.
pub async fn relay_ws(
    State(state): State<AppState>,
    Query(query): Query<RelayQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !state.node.relay_enabled() {
        return api_error(StatusCode::NOT_FOUND, "Relay is disabled on this proxy.", "");
    }
    let relay = state.node.relay().clone();
    if relay.is_closed() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Relay is shutting down.",
            "",
        );
    }

    let kind = match headers.get(RELAY_MESH_KEY_HEADER) {
        None => ConnKind::Client,
        Some(provided) => {
            let provided = provided.to_str().unwrap_or_default();
            if !relay.mesh_key_matches(provided) {
                tracing::warn!("relay mesh peer rejected: mesh key mismatch");
                return api_error(StatusCode::UNAUTHORIZED, "Invalid mesh key.", "");
            }
            ConnKind::MeshPeer
        }
    };

    let Some(ws) = ws else {
        return api_error(
            StatusCode::UPGRADE_REQUIRED,
            "Relay requires a websocket upgrade.",
            "",
        );
    };

    let id = query.id.unwrap_or_else(Uuid::new_v4);
    if !relay.can_claim(id, kind) {
        tracing::warn!(peer = %id, "relay client rejected: peer id already connected");
        return api_error(
            StatusCode::CONFLICT,
            "Relay peer id is already connected.",
            "",
        );
    }
    ws.on_upgrade(move |socket| relay.serve(socket, id, kind))
        .into_response()
}

/// `GET /derp/latency-check`, `GET /latency-check`
pub async fn latency_check() -> StatusCode {
    StatusCode::OK
}
