//! Raw per-agent dial: one websocket to the primary's coordination endpoint
//! per workspace agent.
//!
//! The dialer strategies in the gateway decide when to call this and how to
//! share the resulting streams; this module only knows how to open one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use wsp_protocol::{agent_coordinate_path, SESSION_TOKEN_HEADER};

use crate::client::PrimaryClient;
use crate::types::DialError;

/// An open connection to one workspace agent.
#[async_trait]
pub trait AgentStream: Send + Sync {
    fn agent_id(&self) -> Uuid;

    /// True once the stream was closed locally or the far end went away.
    fn is_closed(&self) -> bool;

    /// Close the stream.  Closing twice is a no-op.
    async fn close(&self) -> Result<(), DialError>;
}

/// Opens a fresh [`AgentStream`] for a destination agent.
///
/// Implementations must not retry: a failed dial is returned as-is.
#[async_trait]
pub trait DialAgent: Send + Sync {
    async fn dial_agent(&self, agent_id: Uuid) -> Result<Box<dyn AgentStream>, DialError>;
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket-backed agent stream.
///
/// The read half is drained by a background task so pings are answered
/// and a remote close, EOF or transport error marks the stream closed.
pub struct WsAgentStream {
    agent_id: Uuid,
    sink: Mutex<Option<SplitSink<Socket, Message>>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsAgentStream {
    fn spawn(agent_id: Uuid, socket: Socket) -> Self {
        let (sink, stream) = socket.split();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(watch_remote(agent_id, stream, closed.clone()));
        Self {
            agent_id,
            sink: Mutex::new(Some(sink)),
            closed,
            reader,
        }
    }
}

async fn watch_remote(agent_id: Uuid, mut stream: SplitStream<Socket>, closed: Arc<AtomicBool>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(agent_id = %agent_id, ?frame, "agent stream closed by remote");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(agent_id = %agent_id, error = %e, "agent stream read failed");
                break;
            }
            None => break,
        }
    }
    closed.store(true, Ordering::Release);
}

#[async_trait]
impl AgentStream for WsAgentStream {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), DialError> {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return Ok(());
        };
        let remote_gone = self.closed.swap(true, Ordering::AcqRel);
        self.reader.abort();
        if remote_gone {
            return Ok(());
        }
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(DialError::Other(format!(
                "close agent {}: {e}",
                self.agent_id
            ))),
        }
    }
}

impl Drop for WsAgentStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl PrimaryClient {
    fn coordinate_url(&self, agent_id: Uuid) -> Result<url::Url, DialError> {
        let mut url = self
            .url(&agent_coordinate_path(agent_id))
            .map_err(|e| DialError::Other(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| DialError::Other(format!("cannot switch {url} to {scheme}")))?;
        Ok(url)
    }
}

#[async_trait]
impl DialAgent for PrimaryClient {
    async fn dial_agent(&self, agent_id: Uuid) -> Result<Box<dyn AgentStream>, DialError> {
        let url = self.coordinate_url(agent_id)?;
        let mut req = url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::Other(format!("build request: {e}")))?;
        let token = HeaderValue::from_str(self.session_token())
            .map_err(|e| DialError::Other(format!("session token header: {e}")))?;
        req.headers_mut().insert(SESSION_TOKEN_HEADER, token);

        let timeout = dial_timeout(self.timeout());
        let connect = tokio_tungstenite::connect_async(req);
        let (socket, _resp) = match tokio::time::timeout(timeout, connect).await {
            Err(_) => return Err(DialError::Timeout(agent_id)),
            Ok(Err(e)) => return Err(classify(agent_id, e)),
            Ok(Ok(pair)) => pair,
        };

        tracing::debug!(agent_id = %agent_id, "agent stream opened");
        Ok(Box::new(WsAgentStream::spawn(agent_id, socket)))
    }
}

fn dial_timeout(request_timeout: Duration) -> Duration {
    request_timeout.min(Duration::from_secs(30))
}

fn classify(agent_id: Uuid, err: WsError) -> DialError {
    match err {
        WsError::Http(resp) => {
            let status = resp.status().as_u16();
            let body = resp
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            match status {
                401 | 403 => DialError::Unauthorized(agent_id, format!("status {status} {body}")),
                404 => DialError::NotFound(agent_id),
                _ => DialError::Unreachable(agent_id, format!("status {status} {body}")),
            }
        }
        other => DialError::Unreachable(agent_id, other.to_string()),
    }
}
