use std::{fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;

use super::{CacheBackend, MemoryBackend};
use crate::error::CacheError;

/// Change-notification buffer per subscriber. Slow subscribers skip ahead.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Identifies the tab (client instance) that made a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u64);

impl TabId {
    /// Wrap a raw id, typically `Environment::random_u64`.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{:016x}", self.0)
    }
}

/// A value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    /// Key written.
    pub key: String,
    /// Value before the write.
    pub old_value: Option<String>,
    /// Value after the write; `None` for removals.
    pub new_value: Option<String>,
    /// Tab that wrote it.
    pub origin: TabId,
}

/// Cache shared by all tabs of one user agent.
///
/// Clone is cheap; clones share the backend and the change channel.
#[derive(Clone)]
pub struct SharedCache {
    backend: Arc<dyn CacheBackend>,
    changes: broadcast::Sender<CacheChange>,
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("subscribers", &self.changes.receiver_count())
            .finish_non_exhaustive()
    }
}

impl SharedCache {
    /// Share `backend` between tabs.
    pub fn new(backend: impl CacheBackend) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { backend: Arc::new(backend), changes }
    }

    /// Volatile cache.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Handle for one tab.
    pub fn tab(&self, origin: TabId) -> TabCache {
        TabCache { shared: self.clone(), origin }
    }

    fn write(
        &self,
        origin: TabId,
        key: &str,
        new_value: Option<&str>,
    ) -> Result<(), CacheError> {
        let old_value = match new_value {
            Some(value) => self.backend.set(key, value)?,
            None => self.backend.remove(key)?,
        };

        if old_value.as_deref() == new_value {
            return Ok(());
        }

        // No receivers is fine: nobody else is listening yet.
        let _ = self.changes.send(CacheChange {
            key: key.to_string(),
            old_value,
            new_value: new_value.map(str::to_string),
            origin,
        });
        Ok(())
    }
}

/// One tab's view of the shared cache.
#[derive(Debug, Clone)]
pub struct TabCache {
    shared: SharedCache,
    origin: TabId,
}

impl TabCache {
    /// Tab identity stamped on writes.
    pub fn origin(&self) -> TabId {
        self.origin
    }

    /// Raw read.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    pub fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.shared.backend.get(key)
    }

    /// Raw write. Notifies other tabs if the value changed.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    pub fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.shared.write(self.origin, key, Some(value))
    }

    /// Delete. Notifies other tabs if a value existed.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.shared.write(self.origin, key, None)
    }

    /// Typed read. An entry that fails to deserialize is deleted and reported
    /// as absent.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(key, %error, "discarding corrupt cache entry");
                self.remove(key)?;
                Ok(None)
            },
        }
    }

    /// Typed write.
    ///
    /// # Errors
    ///
    /// - `CacheError::Serialization` if `value` cannot be encoded
    /// - `CacheError::Io` if the backend fails
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    /// Changes made by other tabs from now on.
    pub fn subscribe(&self) -> CacheSubscription {
        CacheSubscription { receiver: self.shared.changes.subscribe(), origin: self.origin }
    }
}

/// Stream of changes made by other tabs.
#[derive(Debug)]
pub struct CacheSubscription {
    receiver: broadcast::Receiver<CacheChange>,
    origin: TabId,
}

impl CacheSubscription {
    /// Next foreign change. `None` once every cache handle is gone.
    pub async fn recv(&mut self) -> Option<CacheChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.origin == self.origin => {},
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cache subscriber lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next foreign change if one is already queued.
    pub fn try_next(&mut self) -> Option<CacheChange> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) if change.origin == self.origin => {},
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cache subscriber lagged");
                },
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tabs() -> (TabCache, TabCache) {
        let shared = SharedCache::in_memory();
        (shared.tab(TabId::new(1)), shared.tab(TabId::new(2)))
    }

    #[test]
    fn other_tabs_see_changes() {
        let (a, b) = two_tabs();
        let mut a_changes = a.subscribe();
        let mut b_changes = b.subscribe();

        a.set("k", "v").unwrap();

        assert!(a_changes.try_next().is_none());
        assert_eq!(b_changes.try_next(), Some(CacheChange {
            key: "k".into(),
            old_value: None,
            new_value: Some("v".into()),
            origin: TabId::new(1),
        }));
    }

    #[test]
    fn identical_write_is_silent() {
        let (a, b) = two_tabs();
        a.set("k", "v").unwrap();
        let mut changes = b.subscribe();

        a.set("k", "v").unwrap();
        a.remove("missing").unwrap();
        assert!(changes.try_next().is_none());
    }

    #[test]
    fn removal_reports_old_value() {
        let (a, b) = two_tabs();
        a.set("k", "v").unwrap();
        let mut changes = a.subscribe();

        b.remove("k").unwrap();
        let change = changes.try_next().unwrap();
        assert_eq!(change.old_value.as_deref(), Some("v"));
        assert_eq!(change.new_value, None);
    }

    #[test]
    fn corrupt_json_discarded() {
        let (a, _) = two_tabs();
        a.set("k", "{not json").unwrap();

        let value: Option<Vec<u32>> = a.get_json("k").unwrap();
        assert_eq!(value, None);
        assert_eq!(a.get("k").unwrap(), None);
    }

    #[test]
    fn json_roundtrip() {
        let (a, b) = two_tabs();
        a.set_json("k", &[1u32, 2, 3]).unwrap();
        assert_eq!(b.get_json::<Vec<u32>>("k").unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn async_recv_skips_own_writes() {
        let (a, b) = two_tabs();
        let mut changes = a.subscribe();

        a.set("own", "1").unwrap();
        b.set("foreign", "2").unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "foreign");
    }
}
