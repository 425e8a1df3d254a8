//! Test data builders.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use parley_core::Credentials;
use parley_proto::{ChatMessage, Notification};
use serde_json::{Value, json};

use crate::sim_env::SIM_EPOCH_SECS;

/// Unsigned JWT whose payload carries `exp`.
pub fn jwt(exp: i64) -> String {
    let claims = URL_SAFE_NO_PAD.encode(json!({ "exp": exp, "sub": "sim" }).to_string());
    format!("e30.{claims}.sig")
}

/// Credentials for `user` that expire long after any simulation ends.
pub fn credentials(user: &str) -> Credentials {
    // Built from a well-formed token, so this cannot fail.
    Credentials::from_parts(Some(jwt(SIM_EPOCH_SECS + 10 * 365 * 86_400)), Some(user.to_string()))
        .unwrap_or_else(|_| unreachable!("fixture token is well formed"))
}

/// Wall-clock instant `offset` seconds after the simulation epoch.
pub fn at(offset: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(SIM_EPOCH_SECS, 0).unwrap_or_default() + TimeDelta::seconds(offset)
}

/// Chat message `id` in `conversation`.
pub fn chat_message(
    id: &str,
    conversation: &str,
    sender: &str,
    offset: i64,
    read: bool,
) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_id: sender.into(),
        receiver_id: None,
        content: format!("message {id}"),
        created_at: at(offset),
        is_read: read,
    }
}

/// Notification `id`.
pub fn notification(id: &str, read: bool, offset: i64) -> Notification {
    Notification {
        id: id.into(),
        content: format!("notification {id}"),
        kind: None,
        read,
        created_at: at(offset),
    }
}

/// Wire JSON for a chat message, as the broker and REST API send it.
pub fn chat_message_json(message: &ChatMessage) -> Value {
    json!({
        "id": message.id.as_str(),
        "conversationId": message.conversation_id.as_str(),
        "senderId": message.sender_id.as_str(),
        "content": message.content,
        "createdAt": message.created_at.to_rfc3339(),
        "isRead": message.is_read,
    })
}

/// Wire JSON for a notification.
pub fn notification_json(notification: &Notification) -> Value {
    json!({
        "id": notification.id.as_str(),
        "content": notification.content,
        "read": notification.read,
        "createdAt": notification.created_at.to_rfc3339(),
    })
}

/// Wire JSON for a conversation between `me` and `other`.
pub fn conversation_json(id: &str, me: &str, other: &str, unread: u32, offset: i64) -> Value {
    json!({
        "id": id,
        "participantIds": [me, other],
        "unreadCount": unread,
        "updatedAt": at(offset).to_rfc3339(),
    })
}
