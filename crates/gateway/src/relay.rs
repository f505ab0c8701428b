//! In-process relay hub served at `GET /derp`.
//!
//! Clients identify themselves with `?id=<uuid>` and exchange binary
//! frames addressed by a 16-byte peer id prefix.  An id that is already
//! connected can only be taken over by a keyed mesh peer.  Sibling replicas connect
//! as mesh peers by presenting the mesh key; when told to, the hub also
//! dials out to every sibling and keeps those links up.
//!
//! Forwarding is local only: frames are delivered to peers connected to
//! this hub.  Outbound mesh links are kept alive and their inbound frames
//! discarded, so no traffic is relayed between siblings yet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;
use wsp_protocol::RELAY_MESH_KEY_HEADER;

use crate::mesh::{RelayError, RelayServer};

const PEER_ID_LEN: usize = 16;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Client,
    MeshPeer,
}

struct ConnectedPeer {
    kind: ConnKind,
    connected_at: DateTime<Utc>,
    sink: mpsc::Sender<Message>,
}

/// Counts exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub clients: usize,
    pub mesh_peers: usize,
    pub outbound_links: usize,
}

pub struct RelayHub {
    mesh_key: Arc<RwLock<Option<String>>>,
    conns: RwLock<HashMap<Uuid, ConnectedPeer>>,
    /// Outbound mesh links keyed by sibling relay address.
    links: Mutex<HashMap<String, CancellationToken>>,
    backoff: LinkBackoff,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            mesh_key: Arc::new(RwLock::new(None)),
            conns: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            backoff: LinkBackoff::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Constant-time check of a presented mesh key.  Always `false` until a
    /// key has been installed.
    pub fn mesh_key_matches(&self, provided: &str) -> bool {
        let guard = self.mesh_key.read();
        let Some(expected) = guard.as_deref() else {
            return false;
        };
        let a = Sha256::digest(provided.as_bytes());
        let b = Sha256::digest(expected.as_bytes());
        a.ct_eq(&b).into()
    }

    pub fn stats(&self) -> RelayStats {
        let conns = self.conns.read();
        let mesh_peers = conns
            .values()
            .filter(|c| c.kind == ConnKind::MeshPeer)
            .count();
        RelayStats {
            clients: conns.len() - mesh_peers,
            mesh_peers,
            outbound_links: self.links.lock().len(),
        }
    }

    /// Whether a new connection of `kind` may take peer id `id`.  Clients
    /// cannot prove who they are, so only a keyed mesh peer may take over an
    /// id that is already connected.
    pub fn can_claim(&self, id: Uuid, kind: ConnKind) -> bool {
        kind == ConnKind::MeshPeer || !self.conns.read().contains_key(&id)
    }

    /// Serve one upgraded websocket until either side closes or the hub
    /// shuts down.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, id: Uuid, kind: ConnKind) {
        if self.is_closed() {
            return;
        }
        self.tasks.track_future(self.run_socket(socket, id, kind)).await;
    }

    async fn run_socket(&self, socket: WebSocket, id: Uuid, kind: ConnKind) {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        let connected_at = Utc::now();
        let admitted = {
            let mut conns = self.conns.write();
            if kind == ConnKind::Client && conns.contains_key(&id) {
                false
            } else {
                let prev = conns.insert(
                    id,
                    ConnectedPeer {
                        kind,
                        connected_at,
                        sink: tx,
                    },
                );
                if let Some(prev) = prev {
                    tracing::debug!(peer = %id, since = %prev.connected_at, "replacing relay connection");
                }
                true
            }
        };
        if !admitted {
            tracing::warn!(peer = %id, "relay peer id already connected, rejecting client");
            let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, ws_sink.send(Message::Close(None))).await;
            return;
        }
        tracing::info!(peer = %id, kind = ?kind, "relay connection opened");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(
                        CLOSE_FRAME_TIMEOUT,
                        ws_sink.send(Message::Close(None)),
                    )
                    .await;
                    break;
                }
                out = rx.recv() => match out {
                    Some(msg) => {
                        if ws_sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                inbound = ws_stream.next() => match inbound {
                    Some(Ok(Message::Binary(frame))) => self.forward(id, &frame),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(peer = %id, error = %e, "relay read error");
                        break;
                    }
                },
            }
        }

        let mut conns = self.conns.write();
        // A reconnect may already have replaced this entry.
        if conns.get(&id).is_some_and(|c| c.connected_at == connected_at) {
            conns.remove(&id);
        }
        drop(conns);
        tracing::info!(peer = %id, "relay connection closed");
    }

    /// Route `[dst id | payload]` to a local peer as `[src id | payload]`.
    fn forward(&self, src: Uuid, frame: &[u8]) {
        if frame.len() < PEER_ID_LEN {
            tracing::debug!(peer = %src, len = frame.len(), "dropping short relay frame");
            return;
        }
        let (dst, payload) = frame.split_at(PEER_ID_LEN);
        let Ok(dst) = Uuid::from_slice(dst) else {
            return;
        };

        let mut out = Vec::with_capacity(frame.len());
        out.extend_from_slice(src.as_bytes());
        out.extend_from_slice(payload);

        let conns = self.conns.read();
        match conns.get(&dst) {
            Some(peer) => {
                if peer.sink.try_send(Message::Binary(out)).is_err() {
                    tracing::debug!(src = %src, dst = %dst, "relay peer backlogged, frame dropped");
                }
            }
            None => tracing::trace!(src = %src, dst = %dst, "relay destination not connected"),
        }
    }

    /// Stop accepting connections, close every socket and mesh link, and
    /// wait for their tasks.  Idempotent.
    pub async fn close(&self) -> Result<(), RelayError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        self.links.lock().clear();
        self.tasks.close();
        self.tasks.wait().await;
        self.conns.write().clear();
        tracing::info!("relay closed");
        Ok(())
    }

    fn reconcile_links(&self, wanted: HashMap<String, Url>) {
        let mut links = self.links.lock();
        links.retain(|addr, token| {
            let keep = wanted.contains_key(addr);
            if !keep {
                token.cancel();
                tracing::info!(address = %addr, "mesh link removed");
            }
            keep
        });

        for (addr, url) in wanted {
            if links.contains_key(&addr) {
                continue;
            }
            let token = self.cancel.child_token();
            self.tasks.spawn(mesh_link(
                url,
                self.mesh_key.clone(),
                self.backoff.clone(),
                token.clone(),
            ));
            tracing::info!(address = %addr, "mesh link added");
            links.insert(addr, token);
        }
    }
}

impl RelayServer for RelayHub {
    fn set_mesh_key(&self, key: &str) {
        *self.mesh_key.write() = Some(key.to_owned());
    }

    fn set_mesh_peers(
        &self,
        addresses: &[String],
        self_is_destination: bool,
    ) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        if self_is_destination {
            // Siblings dial us; drop every outbound link.
            self.reconcile_links(HashMap::new());
            return Ok(());
        }

        let mut wanted = HashMap::new();
        let mut invalid = None;
        let unique: HashSet<&String> = addresses.iter().collect();
        for addr in unique {
            match relay_ws_url(addr) {
                Ok(url) => {
                    wanted.insert(addr.clone(), url);
                }
                Err(e) => invalid = Some(e),
            }
        }
        self.reconcile_links(wanted);
        invalid.map_or(Ok(()), Err)
    }
}

/// `http://host:port` → `ws://host:port/derp`.
fn relay_ws_url(address: &str) -> Result<Url, RelayError> {
    let invalid = |reason: String| RelayError::InvalidAddress {
        address: address.to_owned(),
        reason,
    };
    let mut url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch to {scheme}")))?;
    url.set_path("/derp");
    Ok(url)
}

// ── Outbound mesh links ──────────────────────────────────────────────

async fn mesh_link(
    url: Url,
    key: Arc<RwLock<Option<String>>>,
    backoff: LinkBackoff,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let connect = connect_mesh(&url, &key);
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = connect => r,
        };

        match result {
            Ok(mut socket) => {
                attempt = 0;
                tracing::info!(peer = %url, "mesh link up");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, socket.close(None)).await;
                            return;
                        }
                        msg = socket.next() => match msg {
                            // Sibling frames are not routed across the mesh.
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                    }
                }
                tracing::warn!(peer = %url, "mesh link dropped");
            }
            Err(e) => {
                tracing::debug!(peer = %url, attempt, error = %e, "mesh dial failed");
            }
        }

        let delay = backoff.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_mesh(
    url: &Url,
    key: &RwLock<Option<String>>,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    String,
> {
    let mut req = url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    let key = key.read().clone().unwrap_or_default();
    let value = HeaderValue::from_str(&key).map_err(|e| e.to_string())?;
    req.headers_mut().insert(RELAY_MESH_KEY_HEADER, value);
    let (socket, _) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|e| e.to_string())?;
    Ok(socket)
}

/// Exponential back-off with a little deterministic jitter so siblings
/// restarted together do not redial in lockstep.
#[derive(Debug, Clone)]
struct LinkBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
}

impl Default for LinkBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl LinkBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.factor.powi(attempt.min(16) as i32);
        let capped = base.min(self.max.as_millis() as f64);
        let spread = (attempt.wrapping_mul(2_654_435_761) as f64) / (u32::MAX as f64);
        Duration::from_millis((capped * (1.0 + 0.2 * spread)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_key_required_and_compared() {
        let hub = RelayHub::new();
        assert!(!hub.mesh_key_matches(""));
        hub.set_mesh_key("secret");
        assert!(hub.mesh_key_matches("secret"));
        assert!(!hub.mesh_key_matches("secreT"));
    }

    #[tokio::test]
    async fn connected_ids_only_claimable_by_mesh_peers() {
        let hub = RelayHub::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        hub.conns.write().insert(
            id,
            ConnectedPeer {
                kind: ConnKind::MeshPeer,
                connected_at: Utc::now(),
                sink: tx,
            },
        );

        assert!(!hub.can_claim(id, ConnKind::Client));
        assert!(hub.can_claim(id, ConnKind::MeshPeer));
        assert!(hub.can_claim(Uuid::new_v4(), ConnKind::Client));
    }

    #[test]
    fn relay_url_switches_to_websocket() {
        assert_eq!(
            relay_ws_url("http://10.0.0.2:3001").unwrap().as_str(),
            "ws://10.0.0.2:3001/derp"
        );
        assert_eq!(
            relay_ws_url("https://eu.proxy.example.com/").unwrap().as_str(),
            "wss://eu.proxy.example.com/derp"
        );
        assert!(relay_ws_url("10.0.0.2:3001").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b = LinkBackoff::default();
        assert!(b.delay_for_attempt(1) > b.delay_for_attempt(0));
        assert!(b.delay_for_attempt(40) <= Duration::from_secs(36));
    }

    #[tokio::test]
    async fn outbound_links_follow_peer_set() {
        let hub = RelayHub::new();
        hub.set_mesh_peers(
            &["http://127.0.0.1:9".into(), "http://127.0.0.1:10".into()],
            false,
        )
        .unwrap();
        assert_eq!(hub.stats().outbound_links, 2);

        hub.set_mesh_peers(&["http://127.0.0.1:10".into()], false)
            .unwrap();
        assert_eq!(hub.stats().outbound_links, 1);

        hub.set_mesh_peers(&["http://127.0.0.1:10".into()], true)
            .unwrap();
        assert_eq!(hub.stats().outbound_links, 0);
    }

    #[tokio::test]
    async fn invalid_address_reported_valid_ones_applied() {
        let hub = RelayHub::new();
        let err = hub
            .set_mesh_peers(&["not a url".into(), "http://127.0.0.1:9".into()], false)
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidAddress { .. }));
        assert_eq!(hub.stats().outbound_links, 1);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_updates() {
        let hub = RelayHub::new();
        hub.set_mesh_peers(&["http://127.0.0.1:9".into()], false)
            .unwrap();
        hub.close().await.unwrap();
        hub.close().await.unwrap();
        assert!(hub.is_closed());
        assert_eq!(hub.stats(), RelayStats::default());
        assert_eq!(
            hub.set_mesh_peers(&["http://127.0.0.1:9".into()], false),
            Err(RelayError::Closed)
        );
    }
}
