//! Cross-tab synchronization over the shared cache.
//!
//! A mutation in one tab is written to a short-lived cache entry under
//! [`CROSS_TAB_KEY`]; other tabs see the write as a [`CacheChange`], decode
//! it with [`CrossTabMessage::decode`] and apply the same mutation through
//! their stores' idempotent paths. The entry is removed again after
//! [`ENTRY_LIFETIME`].
//!
//! ```text
//! Tab A store ─> CrossTabSync::broadcast ─> cache.set(key, record)
//!                                              │
//!                         (100ms later) tick ──┴─> cache.remove(key)
//!
//! Tab B: cache subscription ─> CrossTabMessage::decode ─> store.apply_remote
//! ```

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use parley_core::{
    CacheChange, CacheError, MonotonicInstant, TabCache,
    cache::{CROSS_TAB_KEY, CacheSubscription},
};
use parley_proto::{ChatMessage, ConversationId, MessageId, Notification, NotificationId};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;

/// How long a broadcast entry stays in the cache.
pub const ENTRY_LIFETIME: Duration = Duration::from_millis(100);

/// Connection-status entries older than this are ignored.
pub const CONNECTION_STATUS_MAX_AGE_SECS: i64 = 5 * 60;

/// A mutation to replay in other tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CrossTabMessage {
    /// A notification arrived.
    NotificationNew {
        /// The notification.
        notification: Notification,
    },
    /// A notification was read.
    #[serde(rename_all = "camelCase")]
    NotificationRead {
        /// Which one.
        notification_id: NotificationId,
    },
    /// Every notification was read.
    NotificationsAllRead,
    /// A chat message arrived or was sent.
    ChatNewMessage {
        /// The message.
        message: ChatMessage,
    },
    /// A chat message was read.
    #[serde(rename_all = "camelCase")]
    ChatMessageRead {
        /// Conversation of the message.
        conversation_id: ConversationId,
        /// Which message.
        message_id: MessageId,
    },
    /// A whole conversation was read.
    #[serde(rename_all = "camelCase")]
    ChatConversationRead {
        /// Which conversation.
        conversation_id: ConversationId,
    },
    /// A channel's realtime connection changed.
    Connection {
        /// Which channel.
        channel: ChannelKind,
        /// New state.
        connected: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    message: CrossTabMessage,
    timestamp: DateTime<Utc>,
    seq: u64,
}

impl CrossTabMessage {
    /// Cache key the message is written under. One key per kind, so
    /// different kinds never overwrite each other.
    pub fn key(&self) -> String {
        let kind = match self {
            Self::NotificationNew { .. } => "notification.new",
            Self::NotificationRead { .. } => "notification.read",
            Self::NotificationsAllRead => "notification.all-read",
            Self::ChatNewMessage { .. } => "chat.new-message",
            Self::ChatMessageRead { .. } => "chat.message-read",
            Self::ChatConversationRead { .. } => "chat.conversation-read",
            Self::Connection { channel: ChannelKind::Notification, .. } => "notification.connection",
            Self::Connection { channel: ChannelKind::Chat, .. } => "chat.connection",
        };
        format!("{CROSS_TAB_KEY}.{kind}")
    }

    /// Which store applies the message.
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::NotificationNew { .. }
            | Self::NotificationRead { .. }
            | Self::NotificationsAllRead => ChannelKind::Notification,
            Self::ChatNewMessage { .. }
            | Self::ChatMessageRead { .. }
            | Self::ChatConversationRead { .. } => ChannelKind::Chat,
            Self::Connection { channel, .. } => *channel,
        }
    }

    /// Decode a foreign cache change.
    ///
    /// Returns `None` for unrelated keys, removals, corrupt entries and
    /// connection entries older than five minutes.
    pub fn decode(change: &CacheChange, now: DateTime<Utc>) -> Option<Self> {
        if !change.key.starts_with(CROSS_TAB_KEY) {
            return None;
        }
        let value = change.new_value.as_deref()?;

        let record: Record = match serde_json::from_str(value) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(key = %change.key, error = %err, "corrupt cross-tab entry");
                return None;
            },
        };

        if matches!(record.message, Self::Connection { .. }) {
            let age = now.signed_duration_since(record.timestamp).num_seconds();
            if age > CONNECTION_STATUS_MAX_AGE_SECS {
                tracing::debug!(age, "ignoring stale connection status");
                return None;
            }
        }
        Some(record.message)
    }
}

/// Writes cross-tab entries and removes them once they have been seen.
#[derive(Debug)]
pub struct CrossTabSync<I> {
    cache: TabCache,
    lifetime: Duration,
    pending: VecDeque<(I, String)>,
    seq: u64,
}

impl<I: MonotonicInstant> CrossTabSync<I> {
    /// Sync through `cache`, removing entries after [`ENTRY_LIFETIME`].
    pub fn new(cache: TabCache) -> Self {
        Self::with_lifetime(cache, ENTRY_LIFETIME)
    }

    /// Sync with a custom entry lifetime.
    pub fn with_lifetime(cache: TabCache, lifetime: Duration) -> Self {
        Self { cache, lifetime, pending: VecDeque::new(), seq: 0 }
    }

    /// Publish a mutation to other tabs.
    ///
    /// # Errors
    ///
    /// - `CacheError` if the backend write fails
    pub fn broadcast(
        &mut self,
        message: &CrossTabMessage,
        now: I,
        wall: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let key = message.key();
        self.seq += 1;
        let record = Record { message: message.clone(), timestamp: wall, seq: self.seq };
        self.cache.set_json(&key, &record)?;

        self.pending.retain(|(_, pending)| *pending != key);
        self.pending.push_back((now + self.lifetime, key));
        Ok(())
    }

    /// Remove entries whose lifetime has passed. Returns how many.
    pub fn tick(&mut self, now: I) -> usize {
        let mut removed = 0;
        while let Some((expires, _)) = self.pending.front() {
            if *expires > now {
                break;
            }
            if let Some((_, key)) = self.pending.pop_front() {
                if let Err(err) = self.cache.remove(&key) {
                    tracing::warn!(%key, error = %err, "failed to expire cross-tab entry");
                }
                removed += 1;
            }
        }
        removed
    }

    /// When the next entry expires.
    pub fn next_deadline(&self) -> Option<I> {
        self.pending.iter().map(|(at, _)| *at).min()
    }

    /// Changes written by other tabs.
    pub fn subscribe(&self) -> CacheSubscription {
        self.cache.subscribe()
    }

    /// Drop every pending entry now.
    pub fn clear(&mut self) {
        for (_, key) in self.pending.drain(..) {
            if let Err(err) = self.cache.remove(&key) {
                tracing::warn!(%key, error = %err, "failed to clear cross-tab entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::TimeZone;
    use parley_core::{SharedCache, TabId};

    use super::*;

    fn wall(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn other_tab_decodes_broadcast() {
        let shared = SharedCache::in_memory();
        let mut a: CrossTabSync<Instant> = CrossTabSync::new(shared.tab(TabId::new(1)));
        let b = CrossTabSync::<Instant>::new(shared.tab(TabId::new(2)));
        let mut own = a.subscribe();
        let mut foreign = b.subscribe();

        let message = CrossTabMessage::ChatConversationRead { conversation_id: "c1".into() };
        a.broadcast(&message, Instant::now(), wall(0)).unwrap();

        assert!(own.try_next().is_none());
        let change = foreign.try_next().unwrap();
        assert_eq!(CrossTabMessage::decode(&change, wall(0)), Some(message));
    }

    #[test]
    fn entries_expire_after_lifetime() {
        let shared = SharedCache::in_memory();
        let mut sync: CrossTabSync<Instant> = CrossTabSync::new(shared.tab(TabId::new(1)));
        let reader = shared.tab(TabId::new(2));
        let start = Instant::now();
        let message = CrossTabMessage::NotificationsAllRead;

        sync.broadcast(&message, start, wall(0)).unwrap();
        assert!(reader.get(&message.key()).unwrap().is_some());

        assert_eq!(sync.tick(start + Duration::from_millis(99)), 0);
        assert_eq!(sync.tick(start + Duration::from_millis(100)), 1);
        assert!(reader.get(&message.key()).unwrap().is_none());
        assert!(sync.next_deadline().is_none());
    }

    #[test]
    fn repeated_message_still_notifies() {
        let shared = SharedCache::in_memory();
        let mut a: CrossTabSync<Instant> = CrossTabSync::new(shared.tab(TabId::new(1)));
        let mut foreign = shared.tab(TabId::new(2)).subscribe();
        let message = CrossTabMessage::NotificationRead { notification_id: "n1".into() };

        a.broadcast(&message, Instant::now(), wall(0)).unwrap();
        a.broadcast(&message, Instant::now(), wall(0)).unwrap();

        assert!(foreign.try_next().is_some());
        assert!(foreign.try_next().is_some());
    }

    #[test]
    fn removals_and_foreign_keys_ignored() {
        let change = CacheChange {
            key: "parley.cross-tab.chat.new-message".into(),
            old_value: Some("{}".into()),
            new_value: None,
            origin: TabId::new(1),
        };
        assert_eq!(CrossTabMessage::decode(&change, wall(0)), None);

        let change = CacheChange {
            key: "other".into(),
            old_value: None,
            new_value: Some("{}".into()),
            origin: TabId::new(1),
        };
        assert_eq!(CrossTabMessage::decode(&change, wall(0)), None);
    }

    #[test]
    fn stale_connection_status_ignored() {
        let shared = SharedCache::in_memory();
        let mut sync: CrossTabSync<Instant> = CrossTabSync::new(shared.tab(TabId::new(1)));
        let mut foreign = shared.tab(TabId::new(2)).subscribe();
        let message = CrossTabMessage::Connection { channel: ChannelKind::Chat, connected: true };

        sync.broadcast(&message, Instant::now(), wall(0)).unwrap();
        let change = foreign.try_next().unwrap();

        assert_eq!(CrossTabMessage::decode(&change, wall(300)), Some(message));
        assert_eq!(CrossTabMessage::decode(&change, wall(301)), None);
    }

    #[test]
    fn connection_entry_uses_lowercase_channel() {
        let message =
            CrossTabMessage::Connection { channel: ChannelKind::Notification, connected: false };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["channel"], "notification");

        let back: CrossTabMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
