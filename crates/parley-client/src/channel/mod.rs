//! Feature channel managers.
//!
//! A channel owns a fixed, per-user set of subscriptions on the shared
//! [`parley_core::Transport`], turns deliveries on them into validated
//! [`RealtimeEvent`](crate::RealtimeEvent)s and offers typed send operations.
//!
//! # Lifecycle
//!
//! ```text
//! initialize(callbacks) ─> connect(transport) ─┬─> on_connected ─> deliveries
//!                                              │        ^
//!                                              │        └── every reconnect
//!                                              └─> disconnect (lease release)
//! ```
//!
//! Channels never call stores. Deliveries fire the registered callbacks and
//! queue events in an outbox the driver drains with `take_events`.

mod chat;
mod notification;

pub use chat::{ChatCallbacks, ChatChannel};
pub use notification::{NotificationCallbacks, NotificationChannel, SYSTEM_CONNECTED_NOTICE};
use parley_proto::{ConversationId, MessageId, NotificationId, OutgoingMessage, UserId};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum characters in one chat message.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Which feature a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Notification inbox.
    Notification,
    /// Chat.
    Chat,
}

impl ChannelKind {
    /// Lease held on the shared transport while the channel is wanted.
    pub fn lease_name(self) -> &'static str {
        match self {
            Self::Notification => "notifications",
            Self::Chat => "chat",
        }
    }
}

/// Realtime mutation a store asks a channel to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Mirror a notification read.
    MarkNotificationRead(NotificationId),
    /// Send a chat message.
    SendChat(OutgoingMessage),
    /// Mirror a message read.
    MarkMessageRead(MessageId),
    /// Mirror a conversation read.
    MarkConversationRead(ConversationId),
    /// Chat liveness probe.
    Ping,
}

impl WireCommand {
    /// Channel that sends this command.
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::MarkNotificationRead(_) => ChannelKind::Notification,
            Self::SendChat(_)
            | Self::MarkMessageRead(_)
            | Self::MarkConversationRead(_)
            | Self::Ping => ChannelKind::Chat,
        }
    }
}

/// Check an outgoing chat message before it reaches any transport.
///
/// `me` is the local user when known; self-sends are rejected.
///
/// # Errors
///
/// - `ValidationError` describing the first problem found
pub fn validate_outgoing(
    message: &OutgoingMessage,
    me: Option<&UserId>,
) -> Result<(), ValidationError> {
    if message.receiver_id.is_blank() {
        return Err(ValidationError::MissingReceiver);
    }
    let content = message.content.trim();
    if content.is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong { len, max: MAX_CONTENT_CHARS });
    }
    if me.is_some_and(|me| *me == message.receiver_id) {
        return Err(ValidationError::SelfSend);
    }
    Ok(())
}

pub(crate) fn require_id(id: &str, field: &'static str) -> Result<(), ValidationError> {
    if id.trim().is_empty() { Err(ValidationError::MissingId { field }) } else { Ok(()) }
}
