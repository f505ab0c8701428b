//! HTTP client against an in-process mini primary on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;
use wsp_sdk::{
    AgentStream, BuildInfoResponse, DialAgent, PrimaryApi, PrimaryClientBuilder,
    RegisterProxyRequest, RegisterProxyResponse, SdkError,
};

const TOKEN: &str = "proxy-session-token";

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("Coder-Session-Token")
        .and_then(|v| v.to_str().ok())
        == Some(TOKEN)
}

#[tokio::test]
async fn register_sends_token_and_decodes_response() {
    let (tx, mut rx) = mpsc::unbounded_channel::<RegisterProxyRequest>();
    let router = Router::new().route(
        "/api/v2/workspaceproxies/me/register",
        post(move |headers: HeaderMap, Json(req): Json<RegisterProxyRequest>| {
            let tx = tx.clone();
            async move {
                if !authorized(&headers) {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                tx.send(req).unwrap();
                Ok(Json(serde_json::json!({
                    "app_security_key": "00",
                    "derp_mesh_key": "mesh",
                    "derp_region_id": 999,
                    "sibling_replicas": [{
                        "id": "6b7b3c1e-8f1e-4b8e-9a76-2a3d3f0d1c11",
                        "created_at": "2026-01-01T00:00:00Z",
                        "relay_address": "http://10.0.0.2:3001"
                    }]
                })))
            }
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let req = RegisterProxyRequest {
        access_url: "https://proxy.test".into(),
        version: "2.3.0".into(),
        ..Default::default()
    };
    let resp: RegisterProxyResponse = client.register(&req).await.unwrap();
    assert_eq!(resp.derp_mesh_key, "mesh");
    assert_eq!(resp.derp_region_id, 999);
    assert_eq!(resp.sibling_relay_addresses(), vec!["http://10.0.0.2:3001"]);

    let sent = rx.recv().await.unwrap();
    assert_eq!(sent, req);
}

#[tokio::test]
async fn rejected_token_maps_to_auth_error() {
    let router = Router::new().route(
        "/api/v2/buildinfo",
        get(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "message": "invalid session token" })),
            )
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token("wrong")
        .build()
        .unwrap();
    let err = client.build_info().await.unwrap_err();
    match err {
        SdkError::Auth(msg) => assert!(msg.contains("invalid session token")),
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_body_decoded() {
    let router = Router::new().route(
        "/api/v2/workspaceagents/connection",
        get(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": "database down", "detail": "timeout" })),
            )
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .build()
        .unwrap();
    let err = client.agent_connection_info().await.unwrap_err();
    match err {
        SdkError::Status { status, message, .. } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down: timeout");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn build_info_roundtrip_and_idle_release() {
    let router = Router::new().route(
        "/api/v2/buildinfo",
        get(|| async {
            Json(BuildInfoResponse {
                version: "v2.3.1".into(),
                dashboard_url: "https://coder.example.com".into(),
                ..Default::default()
            })
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .build()
        .unwrap();
    let info = client.build_info().await.unwrap();
    assert_eq!(info.version, "v2.3.1");
    assert!(!info.workspace_proxy);

    client.release_idle_connections();
    // The client stays usable after releasing its pool.
    assert_eq!(client.build_info().await.unwrap().version, "v2.3.1");
}

#[tokio::test]
async fn unreachable_primary_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let err = client.build_info().await.unwrap_err();
    assert!(matches!(err, SdkError::Transport(_) | SdkError::Timeout(_)));
}

#[tokio::test]
async fn agent_stream_notices_remote_hang_up() {
    let router = Router::new().route(
        "/api/v2/workspaceagents/:id/coordinate",
        get(|ws: WebSocketUpgrade| async {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.send(Message::Close(None)).await;
            })
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .build()
        .unwrap();
    let stream = client.dial_agent(Uuid::new_v4()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stream.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stream never noticed the remote close");

    // Closing after the remote went away is still clean.
    stream.close().await.unwrap();
    stream.close().await.unwrap();
}

#[tokio::test]
async fn agent_stream_local_close_is_idempotent() {
    let router = Router::new().route(
        "/api/v2/workspaceagents/:id/coordinate",
        get(|ws: WebSocketUpgrade| async {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(_)) = socket.recv().await {}
            })
        }),
    );
    let addr = serve(router).await;

    let client = PrimaryClientBuilder::new()
        .primary_url(format!("http://{addr}"))
        .session_token(TOKEN)
        .build()
        .unwrap();
    let stream = client.dial_agent(Uuid::new_v4()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stream.is_closed());

    stream.close().await.unwrap();
    assert!(stream.is_closed());
    stream.close().await.unwrap();
}
