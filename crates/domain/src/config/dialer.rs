use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent dialer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the proxy reaches workspace agents.  Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialerStrategy {
    /// One coordinator multiplexing every destination over the relay map.
    SharedSession,
    /// Per-destination session cache.
    #[default]
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    #[serde(default)]
    pub strategy: DialerStrategy,
    /// Evict cached sessions idle for longer than this (seconds).
    /// `None` keeps sessions until the dialer is closed.
    #[serde(default)]
    pub cache_idle_ttl_secs: Option<u64>,
    /// Maximum number of cached sessions.
    #[serde(default = "d_512")]
    pub cache_max_entries: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            strategy: DialerStrategy::default(),
            cache_idle_ttl_secs: None,
            cache_max_entries: 512,
        }
    }
}

impl DialerConfig {
    pub fn cache_idle_ttl(&self) -> Option<Duration> {
        self.cache_idle_ttl_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

fn d_512() -> usize {
    512
}
