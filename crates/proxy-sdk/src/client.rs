//! HTTP client for the primary control plane.
//!
//! [`PrimaryApi`] is the seam the registration loop and the health reporter
//! are written against; [`PrimaryClient`] is the reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;
use wsp_protocol::{
    AgentConnectionInfo, ApiErrorResponse, BuildInfoResponse, RegisterProxyRequest,
    RegisterProxyResponse, AGENT_CONNECTION_INFO_PATH, BUILD_INFO_PATH, REGISTER_PATH,
    SESSION_TOKEN_HEADER,
};

use crate::types::SdkError;

/// Calls a workspace proxy makes against its primary.
#[async_trait]
pub trait PrimaryApi: Send + Sync {
    /// Register (or re-register) this replica.
    async fn register(&self, req: &RegisterProxyRequest)
        -> Result<RegisterProxyResponse, SdkError>;

    /// Build metadata of the primary.
    async fn build_info(&self) -> Result<BuildInfoResponse, SdkError>;

    /// Relay map and connection flags for reaching workspace agents.
    async fn agent_connection_info(&self) -> Result<AgentConnectionInfo, SdkError>;

    /// Drop pooled idle connections.  In-flight requests are unaffected.
    fn release_idle_connections(&self);

    /// Base URL of the primary (also the dashboard URL).
    fn primary_url(&self) -> &Url;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A REST client for the primary, authenticated with the proxy session
/// token.
///
/// Created once per node.  The underlying `reqwest::Client` keeps a
/// connection pool; [`PrimaryApi::release_idle_connections`] swaps it for a
/// fresh one so idle sockets are closed on shutdown.
#[derive(Debug)]
pub struct PrimaryClient {
    http: RwLock<Client>,
    base_url: Url,
    session_token: String,
    timeout: Duration,
}

impl PrimaryClient {
    pub(crate) fn new(base_url: Url, session_token: String, timeout: Duration) -> Result<Self, SdkError> {
        let http = build_http(timeout)?;
        Ok(Self {
            http: RwLock::new(http),
            base_url,
            session_token,
            timeout,
        })
    }

    /// The configured per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn session_token(&self) -> &str {
        &self.session_token
    }

    // ── request helpers ──────────────────────────────────────────────

    /// Build the full URL for an API path like `/api/v2/buildinfo`.
    pub(crate) fn url(&self, path: &str) -> Result<Url, SdkError> {
        self.base_url
            .join(path)
            .map_err(|e| SdkError::Config(format!("join {path}: {e}")))
    }

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.header(SESSION_TOKEN_HEADER, &self.session_token)
            .header(reqwest::header::USER_AGENT, concat!("wsproxy/", env!("CARGO_PKG_VERSION")))
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, SdkError> {
        let url = self.url(endpoint)?;
        let rb = self.decorate(self.http.read().get(url));
        let resp = rb
            .send()
            .await
            .map_err(|e| SdkError::from_reqwest(endpoint, e))?;
        decode(endpoint, resp).await
    }
}

fn build_http(timeout: Duration) -> Result<Client, SdkError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SdkError::Config(format!("build http client: {e}")))
}

/// Decode a 2xx body, or map a failure status to the matching error.
async fn decode<T: DeserializeOwned>(endpoint: &str, resp: Response) -> Result<T, SdkError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| SdkError::Decode(format!("{endpoint}: {e}")));
    }

    let body = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(api) if api.detail.is_empty() => api.message,
        Ok(api) => format!("{}: {}", api.message, api.detail),
        Err(_) => body,
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(SdkError::Auth(format!("{endpoint}: {message}")))
        }
        _ => Err(SdkError::Status {
            endpoint: endpoint.to_owned(),
            status: status.as_u16(),
            message,
        }),
    }
}

#[async_trait]
impl PrimaryApi for PrimaryClient {
    async fn register(
        &self,
        req: &RegisterProxyRequest,
    ) -> Result<RegisterProxyResponse, SdkError> {
        let url = self.url(REGISTER_PATH)?;
        let rb = self.decorate(self.http.read().post(url)).json(req);
        let resp = rb
            .send()
            .await
            .map_err(|e| SdkError::from_reqwest(REGISTER_PATH, e))?;
        decode(REGISTER_PATH, resp).await
    }

    async fn build_info(&self) -> Result<BuildInfoResponse, SdkError> {
        self.get_json(BUILD_INFO_PATH).await
    }

    async fn agent_connection_info(&self) -> Result<AgentConnectionInfo, SdkError> {
        self.get_json(AGENT_CONNECTION_INFO_PATH).await
    }

    fn release_idle_connections(&self) {
        match build_http(self.timeout) {
            Ok(fresh) => {
                // Dropping the old client closes its idle pool; requests
                // already holding a clone finish on their own connection.
                *self.http.write() = fresh;
                tracing::debug!(primary = %self.base_url, "released idle connections");
            }
            Err(e) => tracing::warn!(error = %e, "failed to rebuild http client"),
        }
    }

    fn primary_url(&self) -> &Url {
        &self.base_url
    }
}
