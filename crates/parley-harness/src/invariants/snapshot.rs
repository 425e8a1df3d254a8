//! Observable state snapshots for invariant checking.
//!
//! Invariants run against snapshots rather than live stores so one check
//! sees one consistent moment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parley_client::{ChatStore, NotificationStore};
use parley_proto::{ConversationId, MessageId, NotificationId, UserId};

/// State of every simulated tab.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-tab snapshots.
    pub tabs: Vec<TabSnapshot>,
}

impl SystemSnapshot {
    /// No tabs.
    pub fn empty() -> Self {
        Self::default()
    }

    /// One tab.
    pub fn single(tab: TabSnapshot) -> Self {
        Self { tabs: vec![tab] }
    }

    /// Add a tab.
    pub fn add_tab(&mut self, tab: TabSnapshot) {
        self.tabs.push(tab);
    }
}

/// One message as the invariants see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    /// Message id.
    pub id: MessageId,
    /// Sender.
    pub sender: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Read flag.
    pub is_read: bool,
}

/// Observable state of one tab's stores.
#[derive(Debug, Clone, Default)]
pub struct TabSnapshot {
    /// Tab identifier.
    pub tab: u64,
    /// Local user.
    pub user: Option<UserId>,
    /// Conversation list with the unread count each entry displays.
    pub conversations: Vec<(ConversationId, u32)>,
    /// Loaded messages per conversation, in store order.
    pub threads: BTreeMap<ConversationId, Vec<MessageSnapshot>>,
    /// Global chat unread total.
    pub total_unread: u32,
    /// Per-conversation unread scopes.
    pub scopes: BTreeMap<ConversationId, u32>,
    /// Part of the total no conversation accounts for.
    pub unattributed: u32,
    /// Per-conversation message cap.
    pub max_messages: usize,
    /// Notifications in store order with their read flags.
    pub notifications: Vec<(NotificationId, bool)>,
    /// Notification unread counter.
    pub notification_unread: u32,
    /// Notification cap.
    pub max_notifications: usize,
}

impl TabSnapshot {
    /// Capture both stores of one tab.
    pub fn capture(tab: u64, notifications: &NotificationStore, chat: &ChatStore) -> Self {
        let threads = chat
            .message_threads()
            .map(|(id, list)| {
                let list = list
                    .iter()
                    .map(|m| MessageSnapshot {
                        id: m.id.clone(),
                        sender: m.sender_id.clone(),
                        created_at: m.created_at,
                        is_read: m.is_read,
                    })
                    .collect();
                (id.clone(), list)
            })
            .collect();

        Self {
            tab,
            user: chat.user_id().cloned(),
            conversations: chat
                .conversations()
                .iter()
                .map(|c| (c.id.clone(), c.unread_count))
                .collect(),
            threads,
            total_unread: chat.total_unread(),
            scopes: chat.counters().scopes().map(|(id, n)| (id.clone(), n)).collect(),
            unattributed: chat.counters().unattributed(),
            max_messages: chat.config().max_messages,
            notifications: notifications
                .notifications()
                .iter()
                .map(|n| (n.id.clone(), n.read))
                .collect(),
            notification_unread: notifications.unread_count(),
            max_notifications: notifications.config().max_items,
        }
    }
}
