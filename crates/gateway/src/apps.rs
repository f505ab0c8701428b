//! Application-serving layer.
//!
//! Verifies signed app tokens minted with the security key the primary
//! hands out at registration, then reaches the agent through the
//! [`AgentDialer`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use wsp_domain::config::DialerStrategy;
use wsp_domain::hostname::app_subdomain;
use wsp_sdk::DialError;

use crate::dialer::AgentDialer;

type HmacSha256 = Hmac<Sha256>;

pub const APP_SECURITY_KEY_LEN: usize = 96;
const SIGNING_KEY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("invalid app security key: {0}")]
    InvalidKey(String),
    #[error("no app security key installed")]
    NoKey,
    #[error("invalid app token: {0}")]
    InvalidToken(String),
    #[error("app token expired")]
    Expired,
    #[error("app token was issued for agent {0}")]
    AgentMismatch(Uuid),
    #[error("app server closed")]
    Closed,
    #[error(transparent)]
    Dial(#[from] DialError),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security key & tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 96 random bytes, hex encoded on the wire.  The first 64 bytes sign app
/// tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct AppSecurityKey([u8; APP_SECURITY_KEY_LEN]);

impl AppSecurityKey {
    fn signing_key(&self) -> &[u8] {
        &self.0[..SIGNING_KEY_LEN]
    }

    fn mac(&self) -> Result<HmacSha256, AppError> {
        HmacSha256::new_from_slice(self.signing_key())
            .map_err(|e| AppError::InvalidKey(e.to_string()))
    }

    /// Mint a signed token for `claims`: `hex(json) "." hex(hmac)`.
    pub fn sign(&self, claims: &AppTokenClaims) -> Result<String, AppError> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| AppError::InvalidToken(e.to_string()))?;
        let mut mac = self.mac()?;
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        Ok(format!("{}.{}", hex::encode(&payload), hex::encode(sig)))
    }

    /// Check the signature and expiry of `token`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AppTokenClaims, AppError> {
        let (payload_hex, sig_hex) = token
            .split_once('.')
            .ok_or_else(|| AppError::InvalidToken("malformed".into()))?;
        let payload =
            hex::decode(payload_hex).map_err(|e| AppError::InvalidToken(e.to_string()))?;
        let sig = hex::decode(sig_hex).map_err(|e| AppError::InvalidToken(e.to_string()))?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&sig)
            .map_err(|_| AppError::InvalidToken("signature mismatch".into()))?;

        let claims: AppTokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| AppError::InvalidToken(e.to_string()))?;
        if claims.expires_at <= now {
            return Err(AppError::Expired);
        }
        Ok(claims)
    }
}

impl FromStr for AppSecurityKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| AppError::InvalidKey(e.to_string()))?;
        let key: [u8; APP_SECURITY_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            AppError::InvalidKey(format!(
                "expected {APP_SECURITY_KEY_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for AppSecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppSecurityKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTokenClaims {
    pub agent_id: Uuid,
    /// Application slug the token grants access to.
    pub app: String,
    pub expires_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returned to the caller once the agent is reachable.
#[derive(Debug, Clone, Serialize)]
pub struct AppConnection {
    pub agent_id: Uuid,
    pub app: String,
    pub strategy: DialerStrategy,
    pub region_id: Option<u16>,
    pub session_opened_at: DateTime<Utc>,
}

pub struct AppServer {
    key: RwLock<Option<AppSecurityKey>>,
    dialer: Arc<AgentDialer>,
    hostname: Option<Regex>,
    closed: AtomicBool,
}

impl AppServer {
    pub fn new(dialer: Arc<AgentDialer>, hostname: Option<Regex>) -> Self {
        Self {
            key: RwLock::new(None),
            dialer,
            hostname,
            closed: AtomicBool::new(false),
        }
    }

    /// Install the key from a registration response.  An invalid key leaves
    /// the previous one in place.
    pub fn set_security_key(&self, hex_key: &str) -> Result<(), AppError> {
        let key: AppSecurityKey = hex_key.parse()?;
        let mut current = self.key.write();
        if current.as_ref() != Some(&key) {
            if current.is_some() {
                tracing::info!("app security key rotated");
            }
            *current = Some(key);
        }
        Ok(())
    }

    pub fn has_security_key(&self) -> bool {
        self.key.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subdomain application named by `host`, when wildcard hostnames are
    /// enabled and `host` matches.
    pub fn subdomain_app(&self, host: &str) -> Option<String> {
        let pattern = self.hostname.as_ref()?;
        app_subdomain(pattern, host).map(str::to_owned)
    }

    /// Verify `signed_token` for `agent_id` and dial the agent.
    pub async fn connect(
        &self,
        agent_id: Uuid,
        signed_token: &str,
    ) -> Result<AppConnection, AppError> {
        if self.is_closed() {
            return Err(AppError::Closed);
        }
        let claims = {
            let key = self.key.read();
            let key = key.as_ref().ok_or(AppError::NoKey)?;
            key.verify(signed_token, Utc::now())?
        };
        if claims.agent_id != agent_id {
            return Err(AppError::AgentMismatch(claims.agent_id));
        }

        let conn = self.dialer.dial(agent_id).await?;
        tracing::debug!(agent_id = %agent_id, app = %claims.app, "app connection ready");
        Ok(AppConnection {
            agent_id,
            app: claims.app,
            strategy: self.dialer.strategy(),
            region_id: conn.region_id(),
            session_opened_at: conn.opened_at(),
        })
    }

    /// Stop accepting app traffic.  Connections already dialed stay with
    /// the dialer, which is closed separately.
    pub fn close(&self) -> Result<(), AppError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("app server closed");
        }
        Ok(())
    }
}
