use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Proxy identity & primary connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// URL of the primary control plane (the dashboard).
    #[serde(default)]
    pub primary_url: String,
    /// Externally reachable URL of this proxy.
    #[serde(default)]
    pub access_url: String,
    /// Wildcard hostname for subdomain applications, including the
    /// asterisk (e.g. `*.apps.example.com`).  Empty disables subdomain apps.
    #[serde(default)]
    pub app_hostname: String,
    /// Pre-shared proxy session token.  Prefer `session_token_env` so the
    /// secret stays out of the config file.
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
    /// Environment variable holding the session token when
    /// `session_token` is unset.
    #[serde(default = "d_session_token_env")]
    pub session_token_env: String,
    /// Whether this proxy runs a relay server for NAT traversal.
    #[serde(default = "d_true")]
    pub relay_enabled: bool,
    /// Address siblings use to reach this proxy's relay server
    /// (e.g. `http://10.0.0.5:3001`).
    #[serde(default)]
    pub relay_address: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            access_url: String::new(),
            app_hostname: String::new(),
            session_token: None,
            session_token_env: d_session_token_env(),
            relay_enabled: true,
            relay_address: String::new(),
        }
    }
}

impl ProxyConfig {
    /// Resolve the session token.
    ///
    /// Priority: `proxy.session_token` > env var (`proxy.session_token_env`).
    pub fn resolve_session_token(&self) -> Option<String> {
        self.session_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                std::env::var(&self.session_token_env)
                    .ok()
                    .filter(|t| !t.is_empty())
            })
    }
}

fn d_session_token_env() -> String {
    "WSPROXY_SESSION_TOKEN".into()
}
fn d_true() -> bool {
    true
}
