use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last local mutation before a push runs (ms).
    pub debounce_ms: u64,
    /// Upper bound for a single remote request (ms).
    pub request_timeout_ms: u64,
    /// Period of the remote reachability check (ms).
    pub connectivity_check_ms: u64,
    /// Realtime channel settings.
    pub realtime: RealtimeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            request_timeout_ms: 30_000,
            connectivity_check_ms: 15_000,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connectivity_check(&self) -> Duration {
        Duration::from_millis(self.connectivity_check_ms.max(1))
    }
}

/// Realtime channel lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// How long a channel may stay in `connecting` before it is `timed_out` (ms).
    pub connect_timeout_ms: u64,
    /// First reconnect delay; doubles per consecutive failure (ms).
    pub retry_base_ms: u64,
    /// Reconnect delay cap (ms).
    pub retry_max_ms: u64,
    /// Heartbeat period on open connections (seconds).
    pub heartbeat_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            retry_base_ms: 5_000,
            retry_max_ms: 60_000,
            heartbeat_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt number `failures` (0-based): exponential
    /// from `retry_base_ms`, capped at `retry_max_ms`.
    pub fn backoff(&self, failures: u32) -> Duration {
        const MAX_EXPONENT: u32 = 16;
        let factor = 1u64 << failures.min(MAX_EXPONENT);
        Duration::from_millis(
            self.retry_base_ms
                .saturating_mul(factor)
                .min(self.retry_max_ms),
        )
    }
}
