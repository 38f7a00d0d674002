//! Configuration for the binding cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`crate::BindingCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grace period before an unheld binding is evicted (ms)
    pub idle_grace_ms: u64,
    /// First retry delay after a failed computation (ms)
    pub retry_base_ms: u64,
    /// Upper bound for the retry delay (ms)
    pub retry_max_ms: u64,
    /// Emit a debug event for every delivered notification
    pub log_notifications: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_grace_ms: 5_000,
            retry_base_ms: 250,
            retry_max_ms: 30_000,
            log_notifications: false,
        }
    }
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Set the idle eviction grace period.
    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the retry backoff bounds.
    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_ms = base.as_millis() as u64;
        self.retry_max_ms = max.as_millis().max(base.as_millis()) as u64;
        self
    }

    /// Idle eviction grace period.
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    /// Retry delay after `failures` consecutive failed computations.
    ///
    /// Doubles from `retry_base_ms` and saturates at `retry_max_ms`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(20);
        let delay = self.retry_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_max_ms))
    }
}
