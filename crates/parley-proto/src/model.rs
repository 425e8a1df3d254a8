//! Validated domain records.
//!
//! These are what stores hold and what the cache persists. They are only ever
//! built from wire data through the parse functions in [`crate::payload`], so
//! required fields are known to be present and timestamps are always set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, NotificationId, UserId};

/// A chat message. Immutable once stored, apart from the read flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique within its conversation.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Recipient, when the payload names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Message text.
    pub content: String,
    /// Creation time; synthesized from the local clock when the wire value is
    /// missing or unparseable so ordering is always total.
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read it.
    pub is_read: bool,
}

/// A two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Both participants; the local user first when known.
    pub participant_ids: Vec<UserId>,
    /// Display name of the other participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_participant_name: Option<String>,
    /// Most recent message, if any.
    #[serde(default)]
    pub latest_message: Option<ChatMessage>,
    /// Unread messages addressed to the local user.
    pub unread_count: u32,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// The participant who is not `me`.
    pub fn other_participant(&self, me: &UserId) -> Option<&UserId> {
        self.participant_ids.iter().find(|id| *id != me)
    }
}

/// A notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification id.
    pub id: NotificationId,
    /// Text shown to the user.
    pub content: String,
    /// Category, when the server sends one.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Read flag.
    pub read: bool,
    /// Creation time (synthesized when missing).
    pub created_at: DateTime<Utc>,
}

/// Delivery preference for one notification category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreference {
    /// Category this preference applies to.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable category name.
    #[serde(default)]
    pub display_name: String,
    /// Send by email.
    pub email_enabled: bool,
    /// Send as web push.
    pub web_push_enabled: bool,
}

/// Read receipt for a message the local user sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatusUpdate {
    /// Message that was read.
    pub message_id: MessageId,
    /// Conversation, when included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// New read state.
    pub is_read: bool,
}

/// Server-pushed unread counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountUpdate {
    /// Authoritative total across all conversations.
    pub total_unread_count: u32,
    /// Conversation the change originated from, if the server says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// New count for that conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_unread_count: Option<u32>,
}

/// Client-to-server chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipient.
    pub receiver_id: UserId,
    /// Message text.
    pub content: String,
}
