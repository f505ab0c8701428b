//! Bounded cache of agent sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wsp_sdk::{DialAgent, DialError};

use super::{close_all, is_stale, live_session, AgentConn, AgentSession, Slot};

struct Entry {
    slot: Slot,
    last_used: Instant,
}

struct Inner {
    raw: Arc<dyn DialAgent>,
    max_entries: usize,
    entries: Mutex<HashMap<Uuid, Entry>>,
    closed: AtomicBool,
}

impl Inner {
    /// Remove settled sessions unused for `ttl`.
    fn expire(&self, ttl: Duration) -> Vec<AgentConn> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.lock().retain(|id, entry| {
            if !entry.slot.initialized() || now.duration_since(entry.last_used) < ttl {
                return true;
            }
            tracing::debug!(agent_id = %id, "agent session idle, evicting");
            if let Some(Ok(conn)) = entry.slot.get() {
                expired.push(conn.clone());
            }
            false
        });
        expired
    }
}

pub struct CacheDialer {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl CacheDialer {
    /// `idle_ttl = None` keeps sessions until eviction or close.  The idle
    /// janitor stops when `parent` is cancelled or the dialer closes.
    pub fn new(
        raw: Arc<dyn DialAgent>,
        max_entries: usize,
        idle_ttl: Option<Duration>,
        parent: &CancellationToken,
    ) -> Self {
        let inner = Arc::new(Inner {
            raw,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let cancel = parent.child_token();
        let janitor = idle_ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| tokio::spawn(janitor(Arc::downgrade(&inner), ttl, cancel.clone())));

        Self {
            inner,
            cancel,
            janitor: Mutex::new(janitor),
        }
    }

    pub async fn dial(&self, agent_id: Uuid) -> Result<AgentConn, DialError> {
        let (slot, evicted) = {
            let mut entries = self.inner.entries.lock();
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(DialError::Closed);
            }
            let now = Instant::now();

            if entries.get(&agent_id).is_some_and(|e| is_stale(&e.slot)) {
                entries.remove(&agent_id);
            }

            match entries.get_mut(&agent_id) {
                Some(entry) => {
                    entry.last_used = now;
                    (entry.slot.clone(), None)
                }
                None => {
                    let evicted = if entries.len() >= self.inner.max_entries {
                        evict_lru(&mut entries)
                    } else {
                        None
                    };
                    if entries.len() >= self.inner.max_entries {
                        tracing::debug!(agent_id = %agent_id, "agent session cache full of in-flight dials, over bound");
                    }
                    let slot: Slot = Arc::new(OnceCell::new());
                    entries.insert(
                        agent_id,
                        Entry {
                            slot: slot.clone(),
                            last_used: now,
                        },
                    );
                    (slot, evicted)
                }
            }
        };

        if let Some(conn) = evicted {
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
        }

        let raw = self.inner.raw.clone();
        let result = slot
            .get_or_init(|| async move {
                tracing::debug!(agent_id = %agent_id, "dialing agent");
                raw.dial_agent(agent_id)
                    .await
                    .map(|stream| Arc::new(AgentSession::new(stream, None)))
            })
            .await
            .clone();

        match result {
            Err(e) => {
                let mut entries = self.inner.entries.lock();
                if entries
                    .get(&agent_id)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot))
                {
                    entries.remove(&agent_id);
                }
                Err(e)
            }
            Ok(conn) => {
                if self.inner.closed.load(Ordering::Acquire) {
                    let _ = conn.close().await;
                    return Err(DialError::Closed);
                }
                Ok(conn)
            }
        }
    }

    pub async fn close(&self) -> Result<(), DialError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(handle) = self.janitor.lock().take() {
            handle.abort();
        }
        let sessions: Vec<AgentConn> = self
            .inner
            .entries
            .lock()
            .drain()
            .filter_map(|(_, entry)| live_session(&entry.slot).cloned())
            .collect();
        tracing::info!(sessions = sessions.len(), "closing agent session cache");
        close_all(sessions).await
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evict the least-recently-used settled entry.  In-flight dials are never
/// evicted; when nothing has settled the cache briefly exceeds its bound.
fn evict_lru(entries: &mut HashMap<Uuid, Entry>) -> Option<AgentConn> {
    let victim = entries
        .iter()
        .filter(|(_, e)| e.slot.initialized())
        .min_by_key(|(_, e)| e.last_used)
        .map(|(id, _)| *id)?;
    let entry = entries.remove(&victim)?;
    tracing::debug!(agent_id = %victim, "agent session cache full, evicting");
    live_session(&entry.slot).cloned()
}

async fn janitor(inner: Weak<Inner>, ttl: Duration, cancel: CancellationToken) {
    let period = (ttl / 2).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        let expired = inner.expire(ttl);
        drop(inner);
        if !expired.is_empty() {
            let _ = close_all(expired).await;
        }
    }
}
