//! Messages from [`ParleyHandle`](crate::ParleyHandle) to the runtime task.

use parley_client::{Outcome, StoreError, StoreResult, StoreStatus, store::Pagination};
use parley_core::TransportError;
use parley_proto::{
    ChatMessage, Conversation, ConversationId, MessageId, Notification, NotificationId,
    NotificationPreference, OutgoingMessage,
};
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Notification store operations that issue a ticket.
#[derive(Debug)]
pub(crate) enum NotificationOp {
    Fetch { page: u32, size: u32, append: bool, unread_only: bool },
    FetchMore,
    UnreadCount,
    MarkRead(NotificationId),
    MarkAllRead,
    Preferences,
    UpdatePreference { kind: String, email_enabled: bool, web_push_enabled: bool },
}

/// Chat store operations that issue a ticket.
#[derive(Debug)]
pub(crate) enum ChatOp {
    Conversations,
    UnreadCount,
    Messages { conversation_id: ConversationId, page: u32, size: u32, append: bool },
    MoreMessages(ConversationId),
    Send(OutgoingMessage),
    MarkConversationRead(ConversationId),
}

#[derive(Debug)]
pub(crate) enum Command {
    Start(Reply<StoreResult<()>>),
    Logout(Reply<()>),
    Notification(NotificationOp, Reply<StoreResult<Outcome>>),
    Chat(ChatOp, Reply<StoreResult<Outcome>>),
    RemoveNotification(NotificationId, Reply<bool>),
    MarkMessageRead(MessageId, Reply<StoreResult<bool>>),
    SetActiveConversation(Option<ConversationId>),
    SetVisible(bool),
    SetOnline(bool),
    ManualReconnect(Reply<Result<(), TransportError>>),
    NotificationSnapshot(Reply<NotificationSnapshot>),
    ChatSnapshot(Reply<ChatSnapshot>),
    Messages(ConversationId, Reply<Vec<ChatMessage>>),
    Shutdown,
}

/// Point-in-time copy of the notification store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSnapshot {
    /// Newest first.
    pub notifications: Vec<Notification>,
    /// Unread counter.
    pub unread_count: u32,
    /// Page cursor.
    pub pagination: Pagination,
    /// Delivery preferences.
    pub preferences: Vec<NotificationPreference>,
    /// Realtime channel live.
    pub connected: bool,
    /// Page fetch in flight.
    pub loading: bool,
    /// Last error.
    pub error: Option<StoreError>,
    /// Lifecycle.
    pub status: StoreStatus,
}

/// Point-in-time copy of the chat store, without message lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    /// Most recently active first.
    pub conversations: Vec<Conversation>,
    /// Global unread total.
    pub total_unread: u32,
    /// Open conversation.
    pub active_conversation: Option<ConversationId>,
    /// Realtime channel live.
    pub connected: bool,
    /// Network reachable.
    pub online: bool,
    /// Fetch in flight.
    pub loading: bool,
    /// Last error.
    pub error: Option<StoreError>,
    /// Lifecycle.
    pub status: StoreStatus,
}
