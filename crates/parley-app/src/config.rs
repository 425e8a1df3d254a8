//! Runtime configuration.

use std::{path::PathBuf, time::Duration};

use parley_client::{ChatStoreConfig, NotificationStoreConfig};
use parley_core::{CacheError, SharedCache, TransportConfig, cache::RedbBackend};

/// Default WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";

/// Default REST base URL.
pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

/// Upper bound on how long the runtime sleeps between timer checks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a [`Runtime`](crate::Runtime) needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ParleyConfig {
    /// WebSocket endpoint of the STOMP broker.
    pub endpoint: String,
    /// REST base URL.
    pub api_base: String,
    /// Durable cache file; in-memory when `None`.
    pub cache_path: Option<PathBuf>,
    /// Maximum sleep between timer checks.
    pub tick_interval: Duration,
    /// Queued handle commands before senders wait.
    pub command_buffer: usize,
    /// Realtime transport tuning.
    pub transport: TransportConfig,
    /// Notification store tuning.
    pub notifications: NotificationStoreConfig,
    /// Chat store tuning.
    pub chat: ChatStoreConfig,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            cache_path: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_buffer: 64,
            transport: TransportConfig::default(),
            notifications: NotificationStoreConfig::default(),
            chat: ChatStoreConfig::default(),
        }
    }
}

impl ParleyConfig {
    /// Open the configured cache.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the durable cache file cannot be opened
    pub fn open_cache(&self) -> Result<SharedCache, CacheError> {
        match &self.cache_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "opening durable cache");
                Ok(SharedCache::new(RedbBackend::open(path)?))
            },
            None => Ok(SharedCache::in_memory()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_behaviour() {
        let config = ParleyConfig::default();
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.notifications.max_items, 100);
        assert_eq!(config.chat.max_messages, 200);
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn durable_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = ParleyConfig {
            cache_path: Some(dir.path().join("cache.redb")),
            ..ParleyConfig::default()
        };

        {
            let cache = config.open_cache().unwrap();
            cache.tab(parley_core::TabId::new(1)).set("k", "v").unwrap();
        }
        let cache = config.open_cache().unwrap();
        assert_eq!(cache.tab(parley_core::TabId::new(2)).get("k").unwrap().as_deref(), Some("v"));
    }
}
