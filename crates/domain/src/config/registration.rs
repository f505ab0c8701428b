use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the node does when periodic re-registration keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Swallow failures silently.
    Ignore,
    /// Log every failure and keep serving.
    LogOnly,
    /// Raise the node's fatal signal once `max_failure_count` consecutive
    /// attempts have failed.  An unregistered proxy must not keep serving.
    #[default]
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Seconds between re-registrations.
    #[serde(default = "d_30")]
    pub interval_secs: u64,
    /// Per-attempt timeout (seconds).
    #[serde(default = "d_10")]
    pub attempt_timeout_secs: u64,
    /// Consecutive failures tolerated before `terminate` fires.
    #[serde(default = "d_10_u32")]
    pub max_failure_count: u32,
    /// How long `close` waits for the loop to drain (seconds).  Must exceed
    /// the attempt timeout.
    #[serde(default = "d_11")]
    pub close_grace_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            attempt_timeout_secs: 10,
            max_failure_count: 10,
            close_grace_secs: 11,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

fn d_30() -> u64 {
    30
}
fn d_10() -> u64 {
    10
}
fn d_10_u32() -> u32 {
    10
}
fn d_11() -> u64 {
    11
}
