//! Client object manager and map cache configuration

use serde::Deserialize;
use std::time::Duration;

/// Client object manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reference hops resolved eagerly by the depth-limited lookup
    pub fault_depth: usize,
    /// Objects requested per fault-in round trip
    pub max_fault_count: usize,
    /// Milliseconds between cleanup queue drains
    pub cleanup_interval_ms: u64,
    /// Tell the server when this process stops holding an object
    pub notify_server_on_cleanup: bool,
    /// Prefetched round trips kept before the oldest is dropped
    pub max_prefetched_batches: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fault_depth: 1,
            max_fault_count: 500,
            cleanup_interval_ms: 1000,
            notify_server_on_cleanup: true,
            max_prefetched_batches: 64,
        }
    }
}

impl ClientConfig {
    /// Cleanup period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

/// Local cache settings for server-backed maps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerMapConfig {
    /// Seconds an entry may sit unread (0 = no idle limit)
    pub max_tti_secs: u64,
    /// Seconds an entry may live after it was cached (0 = no age limit)
    pub max_ttl_secs: u64,
    /// Entries kept per map before the oldest-idle ones go (0 = unbounded)
    pub target_max_count: usize,
    /// Drop keys from every process's cache when any process changes them
    pub invalidate_on_change: bool,
    /// Cache values locally at all
    pub local_cache_enabled: bool,
    /// Milliseconds between eviction sweeps
    pub eviction_interval_ms: u64,
}

impl Default for ServerMapConfig {
    fn default() -> Self {
        Self {
            max_tti_secs: 0,
            max_ttl_secs: 0,
            target_max_count: 0,
            invalidate_on_change: false,
            local_cache_enabled: true,
            eviction_interval_ms: 1000,
        }
    }
}

impl ServerMapConfig {
    /// Idle limit, if any.
    pub fn max_tti(&self) -> Option<Duration> {
        (self.max_tti_secs > 0).then(|| Duration::from_secs(self.max_tti_secs))
    }

    /// Age limit, if any.
    pub fn max_ttl(&self) -> Option<Duration> {
        (self.max_ttl_secs > 0).then(|| Duration::from_secs(self.max_ttl_secs))
    }

    /// Count target, if any.
    pub fn target_max_count(&self) -> Option<usize> {
        (self.target_max_count > 0).then_some(self.target_max_count)
    }

    /// Sweep period.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.fault_depth, 1);
        assert_eq!(config.max_fault_count, 500);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(1));
        assert_eq!(config.max_prefetched_batches, 64);
    }

    #[test]
    fn test_zero_limits_mean_unbounded() {
        let config = ServerMapConfig::default();
        assert_eq!(config.max_tti(), None);
        assert_eq!(config.max_ttl(), None);
        assert_eq!(config.target_max_count(), None);

        let config = ServerMapConfig {
            max_tti_secs: 5,
            target_max_count: 10,
            ..ServerMapConfig::default()
        };
        assert_eq!(config.max_tti(), Some(Duration::from_secs(5)));
        assert_eq!(config.target_max_count(), Some(10));
    }
}
