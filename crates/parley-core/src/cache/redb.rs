//! Redb-backed durable cache.
//!
//! Survives restarts of the client process. Every operation is a single
//! transaction, so `set` observes and replaces the old value atomically.

use std::{path::Path, sync::Arc};

use redb::{Database, TableDefinition};

use super::CacheBackend;
use crate::error::CacheError;

/// Table: cache
/// Key: cache key
/// Value: JSON text
const CACHE: TableDefinition<&str, &str> = TableDefinition::new("cache");

/// Durable backend. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = Database::create(path.as_ref()).map_err(|e| CacheError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| CacheError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(CACHE).map_err(|e| CacheError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| CacheError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl CacheBackend for RedbBackend {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_read().map_err(|e| CacheError::Io(e.to_string()))?;
        let table = txn.open_table(CACHE).map_err(|e| CacheError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| CacheError::Io(e.to_string()))?;
        Ok(value.map(|v| v.value().to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_write().map_err(|e| CacheError::Io(e.to_string()))?;
        let previous = {
            let mut table = txn.open_table(CACHE).map_err(|e| CacheError::Io(e.to_string()))?;
            let old = table.insert(key, value).map_err(|e| CacheError::Io(e.to_string()))?;
            old.map(|v| v.value().to_string())
        };
        txn.commit().map_err(|e| CacheError::Io(e.to_string()))?;

        Ok(previous)
    }

    fn remove(&self, key: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_write().map_err(|e| CacheError::Io(e.to_string()))?;
        let previous = {
            let mut table = txn.open_table(CACHE).map_err(|e| CacheError::Io(e.to_string()))?;
            let old = table.remove(key).map_err(|e| CacheError::Io(e.to_string()))?;
            old.map(|v| v.value().to_string())
        };
        txn.commit().map_err(|e| CacheError::Io(e.to_string()))?;

        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");

        {
            let backend = RedbBackend::open(&path).unwrap();
            assert_eq!(backend.set("k", "v1").unwrap(), None);
            assert_eq!(backend.set("k", "v2").unwrap(), Some("v1".into()));
        }

        let backend = RedbBackend::open(&path).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some("v2".into()));
        assert_eq!(backend.remove("k").unwrap(), Some("v2".into()));
        assert_eq!(backend.get("k").unwrap(), None);
    }
}
