//! Agent dialer strategies.
//!
//! The strategy is chosen once at startup from `[dialer] strategy`:
//!
//! - `shared_session`: one coordinator holds a session per destination,
//!   homed on the relay map from registration.  Sessions are shared by all
//!   callers and live until close.
//! - `cache` (default): a bounded, lazily-filled cache of sessions with
//!   in-flight dial sharing, optional idle expiry and LRU eviction.
//!
//! Both surface dial errors unchanged; neither retries.

mod cache;
mod shared;

pub use cache::CacheDialer;
pub use shared::SharedSessionDialer;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use uuid::Uuid;
use wsp_domain::config::DialerStrategy;
use wsp_protocol::RelayMap;
use wsp_sdk::{AgentStream, DialError};

/// A usable connection to one agent, shared between callers.
pub type AgentConn = Arc<AgentSession>;

pub struct AgentSession {
    stream: Box<dyn AgentStream>,
    region_id: Option<u16>,
    opened_at: DateTime<Utc>,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id())
            .field("region_id", &self.region_id)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    pub(crate) fn new(stream: Box<dyn AgentStream>, region_id: Option<u16>) -> Self {
        Self {
            stream,
            region_id,
            opened_at: Utc::now(),
        }
    }

    pub fn agent_id(&self) -> Uuid {
        self.stream.agent_id()
    }

    /// Relay region the session is homed on, when the strategy uses one.
    pub fn region_id(&self) -> Option<u16> {
        self.region_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub async fn close(&self) -> Result<(), DialError> {
        self.stream.close().await
    }
}

/// One destination's dial, shared by every concurrent caller.  Holds the
/// outcome, error included, so waiters never redial on their own.
pub(crate) type Slot = Arc<OnceCell<Result<AgentConn, DialError>>>;

/// The settled live session in `slot`, if any.
pub(crate) fn live_session(slot: &Slot) -> Option<&AgentConn> {
    match slot.get() {
        Some(Ok(conn)) if !conn.is_closed() => Some(conn),
        _ => None,
    }
}

/// Whether `slot` settled into something unusable (a failed dial or a
/// closed session) and should be replaced.
pub(crate) fn is_stale(slot: &Slot) -> bool {
    slot.initialized() && live_session(slot).is_none()
}

/// Close a batch of sessions, keeping the first error.
pub(crate) async fn close_all(sessions: Vec<AgentConn>) -> Result<(), DialError> {
    let mut first_err = None;
    for session in sessions {
        if let Err(e) = session.close().await {
            tracing::debug!(agent_id = %session.agent_id(), error = %e, "agent session close failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

pub enum AgentDialer {
    SharedSession(SharedSessionDialer),
    Cache(CacheDialer),
}

impl AgentDialer {
    pub fn strategy(&self) -> DialerStrategy {
        match self {
            AgentDialer::SharedSession(_) => DialerStrategy::SharedSession,
            AgentDialer::Cache(_) => DialerStrategy::Cache,
        }
    }

    pub async fn dial(&self, agent_id: Uuid) -> Result<AgentConn, DialError> {
        match self {
            AgentDialer::SharedSession(d) => d.dial(agent_id).await,
            AgentDialer::Cache(d) => d.dial(agent_id).await,
        }
    }

    /// Close every session.  Later dials fail with [`DialError::Closed`].
    pub async fn close(&self) -> Result<(), DialError> {
        match self {
            AgentDialer::SharedSession(d) => d.close().await,
            AgentDialer::Cache(d) => d.close().await,
        }
    }

    /// Apply the relay map from a registration.  Only the shared-session
    /// strategy homes sessions on the relay map; an empty map is ignored.
    pub fn set_relay_map(&self, relay_map: &RelayMap, preferred_region: Option<u16>) {
        if let AgentDialer::SharedSession(d) = self {
            if relay_map.is_empty() {
                tracing::warn!("registration returned an empty relay map, keeping the previous one");
                return;
            }
            d.set_relay_map(relay_map.clone(), preferred_region);
        }
    }

    pub fn active_sessions(&self) -> usize {
        match self {
            AgentDialer::SharedSession(d) => d.len(),
            AgentDialer::Cache(d) => d.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted raw dialer shared by the strategy tests.

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;
    use wsp_sdk::{AgentStream, DialAgent, DialError};

    pub struct FakeStream {
        pub id: Uuid,
        pub closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AgentStream for FakeStream {
        fn agent_id(&self) -> Uuid {
            self.id
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), DialError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeDialer {
        pub dials: AtomicU32,
        pub delay: Option<Duration>,
        pub unreachable: Mutex<HashSet<Uuid>>,
        pub opened: Mutex<Vec<(Uuid, Arc<AtomicBool>)>>,
    }

    impl FakeDialer {
        pub fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }

        pub fn closed_count(&self) -> usize {
            self.opened
                .lock()
                .iter()
                .filter(|(_, c)| c.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait]
    impl DialAgent for FakeDialer {
        async fn dial_agent(&self, agent_id: Uuid) -> Result<Box<dyn AgentStream>, DialError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.unreachable.lock().contains(&agent_id) {
                return Err(DialError::Unreachable(agent_id, "no route".into()));
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.opened.lock().push((agent_id, closed.clone()));
            Ok(Box::new(FakeStream {
                id: agent_id,
                closed,
            }))
        }
    }
}
