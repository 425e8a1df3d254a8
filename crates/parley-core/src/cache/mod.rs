//! Persistent key/value cache with cross-tab change notification.
//!
//! Every tab of the application shares one [`SharedCache`]. Each tab writes
//! through its own [`TabCache`], which stamps writes with the tab's
//! [`TabId`]. A tab's [`CacheSubscription`] sees every change made by
//! *other* tabs and never its own, which is what cross-tab sync builds on.
//!
//! Values are JSON strings. The cache is best-effort: corrupt entries are
//! discarded on read and backend failures surface as [`CacheError`] for the
//! caller to log.

mod memory;
mod redb;
mod shared;

pub use memory::MemoryBackend;
pub use self::redb::RedbBackend;
pub use shared::{CacheChange, CacheSubscription, SharedCache, TabCache, TabId};

use crate::error::CacheError;

/// Cache key for the persisted notification list.
pub const NOTIFICATIONS_KEY: &str = "parley.notifications";

/// Cache key for the persisted conversation list.
pub const CONVERSATIONS_KEY: &str = "parley.conversations";

/// Cache key prefix for per-conversation message lists.
pub const MESSAGES_KEY_PREFIX: &str = "parley.messages.";

/// Cache key for cross-tab broadcast records.
pub const CROSS_TAB_KEY: &str = "parley.cross-tab";

/// Abstract key/value store.
///
/// Implementations MUST guarantee:
///
/// - a `set` is visible to every subsequent `get` through any handle
/// - `set` and `remove` return the value they replaced, atomically
pub trait CacheBackend: Send + Sync + 'static {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value, returning the one it replaced.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    fn set(&self, key: &str, value: &str) -> Result<Option<String>, CacheError>;

    /// Delete a value, returning it.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` if the backend fails
    fn remove(&self, key: &str) -> Result<Option<String>, CacheError>;
}
