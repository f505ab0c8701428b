//! Error types shared by the primary client, the registration loop and the
//! raw agent dialer.

use uuid::Uuid;

/// Errors talking to the primary control plane.
///
/// Cloneable so a single failure can be handed to a hook and logged
/// without giving up ownership.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SdkError {
    #[error("config: {0}")]
    Config(String),
    /// The primary rejected the session token (401/403).
    #[error("auth: {0}")]
    Auth(String),
    /// Non-2xx response other than an auth failure.
    #[error("{endpoint} returned {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },
    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("transport: {0}")]
    Transport(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("decode: {0}")]
    Decode(String),
    /// A caller-supplied hook rejected a registration response.
    #[error("handle response: {0}")]
    Hook(String),
    #[error("shutdown")]
    Shutdown,
}

impl SdkError {
    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SdkError::Timeout(format!("{endpoint}: {err}"))
        } else if err.is_decode() {
            SdkError::Decode(format!("{endpoint}: {err}"))
        } else {
            SdkError::Transport(format!("{endpoint}: {err}"))
        }
    }
}

/// Errors reaching a workspace agent.  Surfaced to the caller, never
/// retried by the dialer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("agent {0} unreachable: {1}")]
    Unreachable(Uuid, String),
    #[error("agent {0} not found")]
    NotFound(Uuid),
    /// The primary rejected the proxy's credentials for this agent.
    #[error("unauthorized to dial agent {0}: {1}")]
    Unauthorized(Uuid, String),
    #[error("dial agent {0} timed out")]
    Timeout(Uuid),
    #[error("relay map has no regions")]
    NoRelayRegions,
    #[error("dialer closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// One failed registration attempt as reported to the failure hook.
#[derive(Debug, Clone)]
pub struct RegistrationFailure {
    pub error: SdkError,
    /// Failures in a row including this one; reset by any success.
    pub consecutive_failures: u32,
}
