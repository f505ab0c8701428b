//! Single coordinator holding one session per destination agent, homed on
//! a region of the registration's relay map.
//!
//! Each destination still gets its own coordination socket to the primary;
//! sessions are not yet multiplexed over one relay tunnel.  The relay map
//! only decides which region a session is labelled with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use uuid::Uuid;
use wsp_protocol::RelayMap;
use wsp_sdk::{DialAgent, DialError};

use super::{close_all, is_stale, live_session, AgentConn, AgentSession, Slot};

pub struct SharedSessionDialer {
    raw: Arc<dyn DialAgent>,
    /// Relay map and preferred home region, kept current by registration.
    relay: RwLock<(RelayMap, Option<u16>)>,
    sessions: Mutex<HashMap<Uuid, Slot>>,
    closed: AtomicBool,
}

impl SharedSessionDialer {
    /// Fails with [`DialError::NoRelayRegions`] when the relay map is empty.
    pub fn new(
        raw: Arc<dyn DialAgent>,
        relay_map: RelayMap,
        preferred_region: Option<u16>,
    ) -> Result<Self, DialError> {
        let regions = relay_map.regions.len();
        if regions == 0 {
            return Err(DialError::NoRelayRegions);
        }
        tracing::info!(regions, preferred_region, "shared session dialer ready");
        Ok(Self {
            raw,
            relay: RwLock::new((relay_map, preferred_region)),
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the relay map.  Existing sessions keep their home region;
    /// new sessions use the new map.
    pub fn set_relay_map(&self, relay_map: RelayMap, preferred_region: Option<u16>) {
        *self.relay.write() = (relay_map, preferred_region);
    }

    pub async fn dial(&self, agent_id: Uuid) -> Result<AgentConn, DialError> {
        let region_id = {
            let relay = self.relay.read();
            relay
                .0
                .home_region(relay.1)
                .map(|r| r.region_id)
                .ok_or(DialError::NoRelayRegions)?
        };

        let slot = {
            let mut sessions = self.sessions.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(DialError::Closed);
            }
            if sessions.get(&agent_id).is_some_and(is_stale) {
                sessions.remove(&agent_id);
            }
            sessions
                .entry(agent_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let raw = self.raw.clone();
        let result = slot
            .get_or_init(|| async move {
                tracing::debug!(agent_id = %agent_id, region_id, "opening shared agent session");
                raw.dial_agent(agent_id)
                    .await
                    .map(|stream| Arc::new(AgentSession::new(stream, Some(region_id))))
            })
            .await
            .clone();

        match result {
            Err(e) => {
                let mut sessions = self.sessions.lock();
                if sessions
                    .get(&agent_id)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot))
                {
                    sessions.remove(&agent_id);
                }
                Err(e)
            }
            Ok(conn) => {
                if self.closed.load(Ordering::Acquire) {
                    let _ = conn.close().await;
                    return Err(DialError::Closed);
                }
                Ok(conn)
            }
        }
    }

    pub async fn close(&self) -> Result<(), DialError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sessions: Vec<AgentConn> = self
            .sessions
            .lock()
            .drain()
            .filter_map(|(_, slot)| live_session(&slot).cloned())
            .collect();
        tracing::info!(sessions = sessions.len(), "closing shared agent sessions");
        close_all(sessions).await
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
