//! Boots a real node against an in-process primary and drives the proxy's
//! HTTP surface over loopback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use uuid::Uuid;

use wsp_domain::config::Config;
use wsp_gateway::apps::{AppSecurityKey, AppTokenClaims};
use wsp_gateway::health::SHUTTING_DOWN_MESSAGE;
use wsp_gateway::{api, bootstrap, ProxyNode};
use wsp_protocol::{
    AgentConnectionInfo, ApiErrorResponse, BuildInfoResponse, ProxyHealthReport,
    RegisterProxyRequest, RegisterProxyResponse, RelayMap, RelayNode, RelayRegion,
    BUILD_VERSION_HEADER, RELAY_MESH_KEY_HEADER, SESSION_TOKEN_HEADER,
};

const TOKEN: &str = "proxy-session-token";
const MESH_KEY: &str = "mesh-key-for-tests";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mini primary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct MiniPrimary {
    is_proxy: AtomicBool,
    build_info_fails: AtomicBool,
    hang_up_agents: AtomicBool,
    registrations: AtomicU32,
    coordinations: AtomicU32,
}

fn security_key_hex() -> String {
    hex::encode([42u8; 96])
}

fn relay_map() -> RelayMap {
    let mut map = RelayMap::default();
    map.regions.insert(
        999,
        RelayRegion {
            region_id: 999,
            region_code: "eu".into(),
            region_name: "Europe".into(),
            nodes: vec![RelayNode {
                name: "999a".into(),
                host_name: "eu.proxy.test".into(),
                ..Default::default()
            }],
        },
    );
    map
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some(TOKEN)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiErrorResponse {
            message: "Invalid proxy token.".into(),
            detail: String::new(),
        }),
    )
        .into_response()
}

async fn register(
    State(p): State<Arc<MiniPrimary>>,
    headers: HeaderMap,
    Json(req): Json<RegisterProxyRequest>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    assert!(!req.replica_id.is_nil());
    p.registrations.fetch_add(1, Ordering::SeqCst);
    Json(RegisterProxyResponse {
        app_security_key: security_key_hex(),
        derp_mesh_key: MESH_KEY.into(),
        derp_region_id: 999,
        derp_map: relay_map(),
        ..Default::default()
    })
    .into_response()
}

async fn build_info(State(p): State<Arc<MiniPrimary>>) -> Response {
    if p.build_info_fails.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiErrorResponse {
                message: "database unavailable".into(),
                detail: String::new(),
            }),
        )
            .into_response();
    }
    Json(BuildInfoResponse {
        version: env!("CARGO_PKG_VERSION").into(),
        workspace_proxy: p.is_proxy.load(Ordering::SeqCst),
        ..Default::default()
    })
    .into_response()
}

async fn connection_info() -> Json<AgentConnectionInfo> {
    Json(AgentConnectionInfo {
        derp_map: relay_map(),
        ..Default::default()
    })
}

async fn coordinate(
    State(p): State<Arc<MiniPrimary>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    p.coordinations.fetch_add(1, Ordering::SeqCst);
    let hang_up = p.hang_up_agents.load(Ordering::SeqCst);
    ws.on_upgrade(move |mut socket| async move {
        if hang_up {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

fn primary_router(p: Arc<MiniPrimary>) -> Router {
    Router::new()
        .route("/api/v2/workspaceproxies/me/register", post(register))
        .route("/api/v2/buildinfo", get(build_info))
        .route("/api/v2/workspaceagents/connection", get(connection_info))
        .route("/api/v2/workspaceagents/:id/coordinate", get(coordinate))
        .with_state(p)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    primary: Arc<MiniPrimary>,
    primary_url: String,
    node: ProxyNode,
    base: String,
    http: reqwest::Client,
}

impl Harness {
    async fn boot() -> Self {
        let primary = Arc::new(MiniPrimary::default());
        let primary_addr = serve(primary_router(primary.clone())).await;
        let primary_url = format!("http://{primary_addr}");

        let mut cfg = Config::default();
        cfg.proxy.primary_url = primary_url.clone();
        cfg.proxy.access_url = "http://eu.proxy.test".into();
        cfg.proxy.app_hostname = "*.apps.proxy.test".into();
        cfg.proxy.session_token = Some(TOKEN.into());
        cfg.proxy.relay_address = "http://127.0.0.1:9".into();

        let state = bootstrap::build_app_state(Arc::new(cfg)).await.unwrap();
        let node = state.node.clone();
        let addr = serve(api::router(state.clone()).with_state(state)).await;

        Self {
            primary,
            primary_url,
            node,
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
    }

    async fn report(&self) -> ProxyHealthReport {
        let resp = self.get("/healthz-report").await;
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    fn app_token(&self, agent_id: Uuid) -> String {
        let key: AppSecurityKey = security_key_hex().parse().unwrap();
        key.sign(&AppTokenClaims {
            agent_id,
            app: "code-server".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
        .unwrap()
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn healthz_and_security_headers() {
    let h = Harness::boot().await;
    let resp = h.get("/healthz").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()[BUILD_VERSION_HEADER],
        h.node.build_info().version.as_str()
    );
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert_eq!(resp.text().await.unwrap(), "OK");
    assert_eq!(h.primary.registrations.load(Ordering::SeqCst), 1);
    h.node.close().await.unwrap();
}

#[tokio::test]
async fn buildinfo_identifies_a_proxy() {
    let h = Harness::boot().await;
    let info: BuildInfoResponse = h.get("/api/v2/buildinfo").await.json().await.unwrap();
    assert!(info.workspace_proxy);
    assert_eq!(info.version, h.node.build_info().version);
    assert_eq!(info.dashboard_url.trim_end_matches('/'), h.primary_url);
    h.node.close().await.unwrap();
}

#[tokio::test]
async fn health_report_tracks_primary() {
    let h = Harness::boot().await;
    assert_eq!(h.report().await, ProxyHealthReport::default());

    h.primary.build_info_fails.store(true, Ordering::SeqCst);
    let report = h.report().await;
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("failed to get build info:"));
    assert!(report.errors[0].contains("database unavailable"));

    h.primary.build_info_fails.store(false, Ordering::SeqCst);
    h.primary.is_proxy.store(true, Ordering::SeqCst);
    let report = h.report().await;
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("is a workspace proxy"));

    h.node.close().await.unwrap();
}

#[tokio::test]
async fn closed_node_reports_shutdown() {
    let h = Harness::boot().await;
    h.node.close().await.unwrap();

    let resp = h.get("/healthz-report").await;
    assert_eq!(resp.status(), 500);
    assert_eq!(resp.text().await.unwrap(), SHUTTING_DOWN_MESSAGE);

    assert_eq!(h.get("/derp").await.status(), 503);

    let agent = Uuid::new_v4();
    let path = format!(
        "/api/v2/workspaceagents/{agent}/connection?signed_token={}",
        h.app_token(agent)
    );
    assert_eq!(h.get(&path).await.status(), 503);
}

#[tokio::test]
async fn unknown_paths_point_to_dashboard() {
    let h = Harness::boot().await;
    let resp = h.get("/workspaces").await;
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    let body: ApiErrorResponse = resp.json().await.unwrap();
    assert!(body.detail.contains(&h.primary_url));
    h.node.close().await.unwrap();
}

#[tokio::test]
async fn latency_checks_are_empty_ok() {
    let h = Harness::boot().await;
    for path in ["/latency-check", "/derp/latency-check"] {
        let resp = h.get(path).await;
        assert_eq!(resp.status(), 200, "{path}");
        assert!(resp.text().await.unwrap().is_empty());
    }
    h.node.close().await.unwrap();
}

#[tokio::test]
async fn relay_checks_mesh_key() {
    let h = Harness::boot().await;

    let wrong = h
        .http
        .get(format!("{}/derp", h.base))
        .header(RELAY_MESH_KEY_HEADER, "not-the-key")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let plain = h.get("/derp").await;
    assert_eq!(plain.status(), 426);

    let url = format!("{}/derp", h.base.replacen("http", "ws", 1));
    let mut req = url.into_client_request().unwrap();
    req.headers_mut()
        .insert(RELAY_MESH_KEY_HEADER, HeaderValue::from_static(MESH_KEY));
    let (mut socket, resp) = tokio_tungstenite::connect_async(req).await.unwrap();
    assert_eq!(resp.status(), 101);
    socket.close(None).await.unwrap();

    h.node.close().await.unwrap();
}

#[tokio::test]
async fn app_connection_dials_agent_through_primary() {
    let h = Harness::boot().await;
    let agent = Uuid::new_v4();

    let path = format!(
        "/api/v2/workspaceagents/{agent}/connection?signed_token={}",
        h.app_token(agent)
    );
    let resp = h.get(&path).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["agent_id"], agent.to_string());
    assert_eq!(body["app"], "code-server");
    assert_eq!(body["strategy"], "cache");

    // Cached: a second request reuses the session.
    assert_eq!(h.get(&path).await.status(), 200);
    assert_eq!(h.primary.coordinations.load(Ordering::SeqCst), 1);

    let other = Uuid::new_v4();
    let mismatched = format!(
        "/api/v2/workspaceagents/{other}/connection?signed_token={}",
        h.app_token(agent)
    );
    assert_eq!(h.get(&mismatched).await.status(), 403);

    let forged = format!("/api/v2/workspaceagents/{agent}/connection?signed_token=00.00");
    assert_eq!(h.get(&forged).await.status(), 401);

    h.node.close().await.unwrap();
}

#[tokio::test]
async fn agent_hang_up_forces_redial() {
    let h = Harness::boot().await;
    h.primary.hang_up_agents.store(true, Ordering::SeqCst);
    let agent = Uuid::new_v4();
    let path = format!(
        "/api/v2/workspaceagents/{agent}/connection?signed_token={}",
        h.app_token(agent)
    );

    assert_eq!(h.get(&path).await.status(), 200);
    assert_eq!(h.primary.coordinations.load(Ordering::SeqCst), 1);

    // Let the proxy observe the agent going away.
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.primary.hang_up_agents.store(false, Ordering::SeqCst);

    assert_eq!(h.get(&path).await.status(), 200);
    assert_eq!(h.primary.coordinations.load(Ordering::SeqCst), 2);
    assert_eq!(h.get(&path).await.status(), 200);
    assert_eq!(h.primary.coordinations.load(Ordering::SeqCst), 2);

    h.node.close().await.unwrap();
}

#[tokio::test]
async fn relay_client_cannot_take_over_connected_peer_id() {
    let h = Harness::boot().await;
    let ws_base = format!("{}/derp", h.base.replacen("http", "ws", 1));
    let mesh_id = Uuid::new_v4();

    let mut req = format!("{ws_base}?id={mesh_id}").into_client_request().unwrap();
    req.headers_mut()
        .insert(RELAY_MESH_KEY_HEADER, HeaderValue::from_static(MESH_KEY));
    let (mut mesh_peer, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    wait_for(|| h.node.relay().stats().mesh_peers == 1).await;

    let err = tokio_tungstenite::connect_async(format!("{ws_base}?id={mesh_id}"))
        .await
        .unwrap_err();
    match err {
        WsError::Http(resp) => assert_eq!(resp.status(), 409),
        other => panic!("expected 409, got {other:?}"),
    }
    let stats = h.node.relay().stats();
    assert_eq!((stats.clients, stats.mesh_peers), (0, 1));

    // Frames addressed to the id still reach the mesh peer.
    let sender_id = Uuid::new_v4();
    let (mut sender, _) = tokio_tungstenite::connect_async(format!("{ws_base}?id={sender_id}"))
        .await
        .unwrap();
    wait_for(|| h.node.relay().stats().clients == 1).await;

    let mut frame = mesh_id.as_bytes().to_vec();
    frame.extend_from_slice(b"hello");
    sender.send(WsMessage::Binary(frame)).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), mesh_peer.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let mut expected = sender_id.as_bytes().to_vec();
    expected.extend_from_slice(b"hello");
    assert_eq!(got, WsMessage::Binary(expected));

    h.node.close().await.unwrap();
}
