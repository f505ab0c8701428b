//! Keeps the local relay server meshed with every sibling replica.
//!
//! The coordinator owns the desired peer set and pushes it, whole, to the
//! relay server.  It never dials anything itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Relay-side errors surfaced to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay closed")]
    Closed,
    #[error("invalid mesh address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// What the coordinator needs from a relay server.
///
/// Implementations own their synchronization; both methods may be called
/// while relay traffic is flowing.
pub trait RelayServer: Send + Sync {
    /// Install the pre-shared key mesh peers must present.
    fn set_mesh_key(&self, key: &str);

    /// Replace the full set of mesh peers.
    ///
    /// `self_is_destination = true` means siblings dial this relay and it
    /// only accepts inbound mesh links; `false` means this relay dials out
    /// to every address.
    fn set_mesh_peers(&self, addresses: &[String], self_is_destination: bool)
        -> Result<(), RelayError>;
}

#[derive(Default)]
struct MeshState {
    /// Last set successfully pushed, with its direction flag.
    pushed: Option<(BTreeSet<String>, bool)>,
    key: Option<String>,
    last_error: Option<String>,
}

pub struct MeshCoordinator {
    relay: Arc<dyn RelayServer>,
    /// This replica's own relay address, never meshed with itself.
    self_address: String,
    state: Mutex<MeshState>,
}

impl MeshCoordinator {
    pub fn new(relay: Arc<dyn RelayServer>, self_address: &str) -> Self {
        Self {
            relay,
            self_address: normalize(self_address),
            state: Mutex::new(MeshState::default()),
        }
    }

    /// Replace the mesh peer set.
    ///
    /// Idempotent: calling again with the same addresses (in any order,
    /// with duplicates) does not push to the relay server again.  Push
    /// failures are logged and retried on the next call.
    pub fn set_addresses(&self, addresses: &[String], self_is_destination: bool) {
        let wanted: BTreeSet<String> = addresses
            .iter()
            .map(|a| normalize(a))
            .filter(|a| !a.is_empty() && *a != self.self_address)
            .collect();

        let mut state = self.state.lock();
        if let Some((current, dest)) = &state.pushed {
            if *current == wanted && *dest == self_is_destination {
                tracing::trace!(peers = wanted.len(), "mesh peers unchanged");
                return;
            }
        }

        let list: Vec<String> = wanted.iter().cloned().collect();
        match self.relay.set_mesh_peers(&list, self_is_destination) {
            Ok(()) => {
                tracing::info!(
                    peers = list.len(),
                    self_is_destination,
                    "mesh peers updated"
                );
                state.pushed = Some((wanted, self_is_destination));
                state.last_error = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, peers = list.len(), "failed to update mesh peers");
                state.pushed = None;
                state.last_error = Some(e.to_string());
            }
        }
    }

    /// Install the mesh key, skipping the push when it is unchanged.
    pub fn set_mesh_key(&self, key: &str) {
        let mut state = self.state.lock();
        if state.key.as_deref() == Some(key) {
            return;
        }
        self.relay.set_mesh_key(key);
        state.key = Some(key.to_owned());
        tracing::debug!("mesh key installed");
    }

    /// Error from the most recent push, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Snapshot of the last pushed peer set.
    pub fn addresses(&self) -> Vec<String> {
        self.state
            .lock()
            .pushed
            .as_ref()
            .map(|(set, _)| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn normalize(address: &str) -> String {
    address.trim().trim_end_matches('/').to_owned()
}
