//! Chat service configuration.
//!
//! Feature switches default to off, matching a conservative deployment:
//! direct messages, room management by ordinary users and access-list or
//! userlist broadcasts must be enabled explicitly.

use serde::Deserialize;
use std::time::Duration;

/// Maximum concurrent transport disconnects during a mass disconnect.
pub const DISCONNECT_CONCURRENCY: usize = 32;

/// Chat service behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Allow `directMessage`.
    #[serde(default)]
    pub enable_direct_messages: bool,

    /// Allow `roomCreate`/`roomDelete` without `bypassPermissions`.
    #[serde(default)]
    pub enable_rooms_management: bool,

    /// Broadcast access list and mode changes to room channels.
    #[serde(default)]
    pub enable_access_lists_updates: bool,

    /// Broadcast `roomUserJoined`/`roomUserLeft` to room channels.
    #[serde(default)]
    pub enable_userlist_updates: bool,

    /// How long a cluster bus request waits for acknowledgements.
    #[serde(default = "default_bus_ack_timeout")]
    pub bus_ack_timeout_ms: u64,

    /// Maximum hold time of a per-user lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// How long to keep retrying a contended lock.
    #[serde(default = "default_lock_acquire_timeout")]
    pub lock_acquire_timeout_ms: u64,

    /// Base delay between lock retries (jittered).
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,

    /// Messages kept per room.
    #[serde(default = "default_history_max_size")]
    pub history_max_size: usize,

    /// Upper bound on messages returned by one history query.
    #[serde(default = "default_history_max_get_messages")]
    pub history_max_get_messages: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enable_direct_messages: false,
            enable_rooms_management: false,
            enable_access_lists_updates: false,
            enable_userlist_updates: false,
            bus_ack_timeout_ms: default_bus_ack_timeout(),
            lock_ttl_ms: default_lock_ttl(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout(),
            lock_retry_delay_ms: default_lock_retry_delay(),
            history_max_size: default_history_max_size(),
            history_max_get_messages: default_history_max_get_messages(),
        }
    }
}

impl ServiceConfig {
    /// Configuration with every feature switch turned on.
    pub fn permissive() -> Self {
        Self {
            enable_direct_messages: true,
            enable_rooms_management: true,
            enable_access_lists_updates: true,
            enable_userlist_updates: true,
            ..Self::default()
        }
    }

    pub fn bus_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_ack_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub(super) fn validate(&self) -> Result<(), String> {
        if self.lock_ttl_ms == 0 {
            return Err("service.lock_ttl_ms must be positive".into());
        }
        if self.bus_ack_timeout_ms == 0 {
            return Err("service.bus_ack_timeout_ms must be positive".into());
        }
        if self.history_max_get_messages == 0 {
            return Err("service.history_max_get_messages must be positive".into());
        }
        Ok(())
    }
}

fn default_bus_ack_timeout() -> u64 {
    5000
}

fn default_lock_ttl() -> u64 {
    5000
}

fn default_lock_acquire_timeout() -> u64 {
    10_000
}

fn default_lock_retry_delay() -> u64 {
    25
}

fn default_history_max_size() -> usize {
    100
}

fn default_history_max_get_messages() -> usize {
    100
}
