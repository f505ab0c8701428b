//! Builder pattern for constructing a [`PrimaryClient`].

use std::time::Duration;

use url::Url;

use crate::client::PrimaryClient;
use crate::types::SdkError;

/// Fluent builder for [`PrimaryClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use wsp_sdk::PrimaryClientBuilder;
/// let client = PrimaryClientBuilder::new()
///     .primary_url("https://coder.example.com")
///     .session_token("proxy-session-token")
///     .timeout(std::time::Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
pub struct PrimaryClientBuilder {
    pub(crate) primary_url: String,
    pub(crate) session_token: Option<String>,
    pub(crate) timeout: Duration,
}

impl PrimaryClientBuilder {
    pub fn new() -> Self {
        Self {
            primary_url: String::new(),
            session_token: None,
            timeout: Duration::from_secs(30),
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Set the primary's base URL (e.g. `https://coder.example.com`).
    pub fn primary_url(mut self, url: impl Into<String>) -> Self {
        self.primary_url = url.into();
        self
    }

    /// Set the pre-shared proxy session token.
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    // ── Tuning ───────────────────────────────────────────────────────

    /// Per-request timeout for plain HTTP calls (default: 30 s).
    ///
    /// The registration loop applies its own, usually shorter, attempt
    /// timeout on top of this.
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    // ── Build ────────────────────────────────────────────────────────

    /// Consume the builder and produce a [`PrimaryClient`].
    pub fn build(self) -> Result<PrimaryClient, SdkError> {
        let base_url = Url::parse(&self.primary_url)
            .map_err(|e| SdkError::Config(format!("invalid primary url {:?}: {e}", self.primary_url)))?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            return Err(SdkError::Config(format!(
                "primary url scheme must be http or https, got {:?}",
                base_url.scheme()
            )));
        }
        let token = self
            .session_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SdkError::Config("session token is required".into()))?;
        if self.timeout.is_zero() {
            return Err(SdkError::Config("timeout must be > 0".into()));
        }

        PrimaryClient::new(base_url, token, self.timeout)
    }
}

impl Default for PrimaryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
