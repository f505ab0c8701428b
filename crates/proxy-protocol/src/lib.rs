//! Proxy protocol: the JSON shapes exchanged between a workspace proxy and
//! the primary control plane, plus the payloads the proxy serves itself.
//!
//! Every type here is plain data.  Transport, retries and authentication
//! live in `wsp-sdk`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the proxy session token on every call to the primary.
pub const SESSION_TOKEN_HEADER: &str = "Coder-Session-Token";

/// Header attached to every proxied response for debugging.
pub const BUILD_VERSION_HEADER: &str = "X-Coder-Build-Version";

/// Header a sibling presents on the relay endpoint to join the mesh.
pub const RELAY_MESH_KEY_HEADER: &str = "X-Relay-Mesh-Key";

// ── Primary API paths ───────────────────────────────────────────────

pub const REGISTER_PATH: &str = "/api/v2/workspaceproxies/me/register";
pub const BUILD_INFO_PATH: &str = "/api/v2/buildinfo";
pub const AGENT_CONNECTION_INFO_PATH: &str = "/api/v2/workspaceagents/connection";

/// Path of the websocket used to reach one workspace agent.
pub fn agent_coordinate_path(agent_id: Uuid) -> String {
    format!("/api/v2/workspaceagents/{agent_id}/coordinate")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proxy → Primary: register (or re-register) this replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterProxyRequest {
    /// Externally reachable URL of the proxy.
    pub access_url: String,
    /// Wildcard hostname for subdomain apps, empty when disabled.
    pub wildcard_hostname: String,
    pub derp_enabled: bool,
    /// Process-instance id, regenerated on every start.
    pub replica_id: Uuid,
    pub replica_hostname: String,
    /// Self-diagnosed problem, empty when healthy.
    pub replica_error: String,
    /// Address siblings use to mesh with this replica's relay server.
    pub replica_relay_address: String,
    pub version: String,
}

/// Primary → Proxy: registration accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterProxyResponse {
    /// Hex-encoded application security key.
    pub app_security_key: String,
    /// Pre-shared key for the relay mesh.
    pub derp_mesh_key: String,
    #[serde(default)]
    pub derp_region_id: u16,
    #[serde(default)]
    pub derp_map: RelayMap,
    #[serde(default)]
    pub derp_force_websockets: bool,
    /// Every other replica of this proxy (and of the primary) whose relay
    /// this replica must mesh with.  Never includes the caller.
    #[serde(default)]
    pub sibling_replicas: Vec<SiblingReplica>,
}

impl RegisterProxyResponse {
    /// Relay addresses of all siblings, in response order.
    pub fn sibling_relay_addresses(&self) -> Vec<String> {
        self.sibling_replicas
            .iter()
            .map(|r| r.relay_address.clone())
            .collect()
    }
}

/// Another replica the proxy must mesh with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingReplica {
    pub id: Uuid,
    #[serde(default)]
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub relay_address: String,
    #[serde(default)]
    pub region_id: i32,
    /// Non-empty when the sibling reported itself unhealthy.
    #[serde(default)]
    pub error: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Relay map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Relay topology used to reach agents that cannot be dialed directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMap {
    #[serde(default)]
    pub regions: BTreeMap<u16, RelayRegion>,
}

impl RelayMap {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The region sessions should home on: `preferred` when present and
    /// non-empty, otherwise the lowest-numbered region with relay nodes.
    pub fn home_region(&self, preferred: Option<u16>) -> Option<&RelayRegion> {
        if let Some(region) = preferred.and_then(|id| self.regions.get(&id)) {
            if !region.nodes.is_empty() {
                return Some(region);
            }
        }
        self.regions.values().find(|r| !r.nodes.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    pub region_id: u16,
    pub region_code: String,
    pub region_name: String,
    #[serde(default)]
    pub nodes: Vec<RelayNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    pub name: String,
    pub host_name: String,
    #[serde(default)]
    pub derp_port: u16,
    #[serde(default)]
    pub stun_port: i32,
    #[serde(default)]
    pub force_http: bool,
}

/// Primary → Proxy: parameters for reaching workspace agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConnectionInfo {
    pub derp_map: RelayMap,
    #[serde(default)]
    pub derp_force_websockets: bool,
    #[serde(default)]
    pub disable_direct_connections: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Build info & health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Served by both the primary and every proxy at `/api/v2/buildinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfoResponse {
    #[serde(default)]
    pub external_url: String,
    pub version: String,
    #[serde(default)]
    pub dashboard_url: String,
    /// `true` when the responder is a workspace proxy, not a primary.
    #[serde(default)]
    pub workspace_proxy: bool,
}

/// Result of a proxy self-diagnosis.
///
/// Errors mean the proxy should not be used; warnings are tolerated skew.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealthReport {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ProxyHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Error body returned by the primary on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub message: String,
    #[serde(default)]
    pub detail: String,
}
