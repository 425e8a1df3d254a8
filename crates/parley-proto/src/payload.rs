//! Parse boundary for wire payloads.
//!
//! Raw JSON is deserialized into permissive `Raw*` shapes (every field
//! optional), then validated into the domain records of [`crate::model`].
//! Missing required fields are a [`ParseError`]; missing timestamps are
//! synthesized from the caller's clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    errors::ParseError,
    ids::{ConversationId, MessageId, NotificationId, UserId},
    model::{
        ChatMessage, Conversation, Notification, NotificationPreference, ReadStatusUpdate,
        UnreadCountUpdate,
    },
    timestamp::normalize_timestamp,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: Option<MessageId>,
    conversation_id: Option<ConversationId>,
    sender_id: Option<UserId>,
    receiver_id: Option<UserId>,
    content: Option<String>,
    created_at: Option<Value>,
    timestamp: Option<Value>,
    is_read: Option<bool>,
    read: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversation {
    id: Option<ConversationId>,
    participant_ids: Option<Vec<UserId>>,
    other_participant_id: Option<UserId>,
    other_participant_name: Option<String>,
    latest_message: Option<Value>,
    unread_count: Option<i64>,
    updated_at: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNotification {
    id: Option<NotificationId>,
    content: Option<String>,
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    is_read: Option<bool>,
    read: Option<bool>,
    created_at: Option<Value>,
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUnread {
    total_unread_count: Option<Value>,
    conversation_id: Option<ConversationId>,
    conversation_unread_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReadStatus {
    message_id: Option<MessageId>,
    conversation_id: Option<ConversationId>,
    is_read: Option<bool>,
    read: Option<bool>,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ParseError> {
    value.ok_or(ParseError::MissingField(field))
}

fn required_id<T: AsRef<str>>(value: Option<T>, field: &'static str) -> Result<T, ParseError> {
    match value {
        Some(id) if !id.as_ref().trim().is_empty() => Ok(id),
        _ => Err(ParseError::MissingField(field)),
    }
}

/// Validate a chat message from an already-parsed JSON value.
pub fn chat_message_from_value(value: Value, now: DateTime<Utc>) -> Result<ChatMessage, ParseError> {
    let raw: RawMessage = serde_json::from_value(value)?;

    let id = required_id(raw.id, "id")?;
    let conversation_id = required_id(raw.conversation_id, "conversationId")?;
    let created_at = normalize_timestamp(raw.created_at.as_ref().or(raw.timestamp.as_ref()), now);

    Ok(ChatMessage {
        id,
        conversation_id,
        sender_id: raw.sender_id.unwrap_or_else(|| UserId::new("")),
        receiver_id: raw.receiver_id,
        content: raw.content.unwrap_or_default(),
        created_at,
        is_read: raw.is_read.or(raw.read).unwrap_or(false),
    })
}

/// Validate a chat message body received on the chat topic.
pub fn parse_chat_message(body: &str, now: DateTime<Utc>) -> Result<ChatMessage, ParseError> {
    chat_message_from_value(serde_json::from_str(body)?, now)
}

/// Validate a conversation summary. `me` fills in the local participant when
/// the server only names the other side.
pub fn conversation_from_value(
    value: Value,
    me: &UserId,
    now: DateTime<Utc>,
) -> Result<Conversation, ParseError> {
    let raw: RawConversation = serde_json::from_value(value)?;

    let id = required_id(raw.id, "id")?;
    let participant_ids = match (raw.participant_ids, raw.other_participant_id) {
        (Some(ids), _) if !ids.is_empty() => ids,
        (_, Some(other)) => vec![me.clone(), other],
        _ => return Err(ParseError::MissingField("otherParticipantId")),
    };

    let latest_message = match raw.latest_message {
        None | Some(Value::Null) => None,
        Some(value) => Some(chat_message_from_value(value, now)?),
    };

    let unread_count = match raw.unread_count {
        None => 0,
        Some(n) => u32::try_from(n).map_err(|_| ParseError::InvalidField {
            field: "unreadCount",
            reason: format!("{n} is not a valid count"),
        })?,
    };

    let updated_at = match raw.updated_at.as_ref() {
        Some(value) => normalize_timestamp(Some(value), now),
        None => latest_message.as_ref().map_or(now, |m| m.created_at),
    };

    Ok(Conversation {
        id,
        participant_ids,
        other_participant_name: raw.other_participant_name,
        latest_message,
        unread_count,
        updated_at,
    })
}

/// Validate a notification from an already-parsed JSON value.
pub fn notification_from_value(
    value: Value,
    now: DateTime<Utc>,
) -> Result<Notification, ParseError> {
    let raw: RawNotification = serde_json::from_value(value)?;

    let id = required_id(raw.id, "id")?;
    let created_at = normalize_timestamp(raw.created_at.as_ref().or(raw.timestamp.as_ref()), now);

    Ok(Notification {
        id,
        content: raw.content.or(raw.message).unwrap_or_default(),
        kind: raw.kind,
        read: raw.is_read.or(raw.read).unwrap_or(false),
        created_at,
    })
}

/// Validate a notification body received on the user topic.
pub fn parse_notification(body: &str, now: DateTime<Utc>) -> Result<Notification, ParseError> {
    notification_from_value(serde_json::from_str(body)?, now)
}

/// Validate a preference entry.
pub fn preference_from_value(value: Value) -> Result<NotificationPreference, ParseError> {
    let pref: NotificationPreference = serde_json::from_value(value)?;
    if pref.kind.trim().is_empty() {
        return Err(ParseError::MissingField("type"));
    }
    Ok(pref)
}

/// Validate an unread counter push. `totalUnreadCount` must be a
/// non-negative integer.
pub fn parse_unread_update(body: &str) -> Result<UnreadCountUpdate, ParseError> {
    let raw: RawUnread = serde_json::from_str(body)?;

    let total = required(raw.total_unread_count, "totalUnreadCount")?;
    let total_unread_count = total
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ParseError::InvalidField {
            field: "totalUnreadCount",
            reason: format!("{total} is not a count"),
        })?;

    Ok(UnreadCountUpdate {
        total_unread_count,
        conversation_id: raw.conversation_id,
        conversation_unread_count: raw.conversation_unread_count,
    })
}

/// Validate a read receipt push. A missing read flag means "read".
pub fn parse_read_status(body: &str) -> Result<ReadStatusUpdate, ParseError> {
    let raw: RawReadStatus = serde_json::from_str(body)?;

    Ok(ReadStatusUpdate {
        message_id: required_id(raw.message_id, "messageId")?,
        conversation_id: raw.conversation_id,
        is_read: raw.is_read.or(raw.read).unwrap_or(true),
    })
}

/// Which mutation an acknowledgment confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckKind {
    /// A single chat message was marked read.
    MessageRead,
    /// A whole conversation was marked read.
    ConversationRead,
    /// A notification was marked read.
    NotificationRead,
}

/// Structured acknowledgment envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Acknowledged operation.
    pub kind: AckKind,
    /// Id of the message, conversation or notification.
    pub ref_id: String,
}

/// Message on a status reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReply {
    /// Recognised acknowledgment.
    Ack(Ack),
    /// Anything else, kept for logging.
    Info(String),
}

/// Text markers used by servers that predate the structured envelope.
/// Longest first: the notification marker contains the message marker.
const LEGACY_MARKERS: [(&str, AckKind); 3] = [
    ("Notification mark-read request received for: ", AckKind::NotificationRead),
    ("mark-conversation-read request received for: ", AckKind::ConversationRead),
    ("mark-read request received for: ", AckKind::MessageRead),
];

/// Classify a status reply body.
pub fn parse_status_reply(body: &str) -> StatusReply {
    let trimmed = body.trim();

    if trimmed.starts_with('{') {
        if let Ok(ack) = serde_json::from_str::<Ack>(trimmed) {
            if !ack.ref_id.trim().is_empty() {
                return StatusReply::Ack(ack);
            }
        }
        return StatusReply::Info(message_field(trimmed).unwrap_or_else(|| trimmed.to_string()));
    }

    let text = if trimmed.starts_with('"') {
        serde_json::from_str::<String>(trimmed).unwrap_or_else(|_| trimmed.to_string())
    } else {
        trimmed.to_string()
    };

    for (marker, kind) in LEGACY_MARKERS {
        if let Some(idx) = text.find(marker) {
            let ref_id = text[idx + marker.len()..].trim();
            if !ref_id.is_empty() {
                return StatusReply::Ack(Ack { kind, ref_id: ref_id.to_string() });
            }
        }
    }

    StatusReply::Info(text)
}

/// Human-readable text of an error reply.
pub fn parse_error_reply(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        if let Some(message) = message_field(trimmed) {
            return message;
        }
    }
    if trimmed.starts_with('"') {
        if let Ok(text) = serde_json::from_str::<String>(trimmed) {
            return text;
        }
    }
    trimmed.to_string()
}

fn message_field(json: &str) -> Option<String> {
    let value: Value = serde_json::from_str(json).ok()?;
    ["message", "error"]
        .into_iter()
        .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn chat_message_requires_ids() {
        let err = parse_chat_message(r#"{"conversationId":"c1"}"#, now()).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("id")));

        let err = parse_chat_message(r#"{"id":"m1","conversationId":""}"#, now()).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("conversationId")));
    }

    #[test]
    fn chat_message_missing_timestamp_is_synthesized() {
        let msg =
            parse_chat_message(r#"{"id":"m1","conversationId":"c1","createdAt":null}"#, now())
                .unwrap();
        assert_eq!(msg.created_at, now());
        assert!(!msg.is_read);
    }

    #[test]
    fn chat_message_accepts_read_alias() {
        let msg = chat_message_from_value(
            json!({"id": 1, "conversationId": 2, "senderId": 3, "read": true, "createdAt": 1_600_000_000}),
            now(),
        )
        .unwrap();
        assert!(msg.is_read);
        assert_eq!(msg.sender_id.as_str(), "3");
        assert_eq!(msg.created_at, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
    }

    #[test]
    fn conversation_fills_local_participant() {
        let me = UserId::new("me");
        let conv = conversation_from_value(
            json!({"id": "c1", "otherParticipantId": "you", "unreadCount": 3}),
            &me,
            now(),
        )
        .unwrap();

        assert_eq!(conv.participant_ids, vec![UserId::new("me"), UserId::new("you")]);
        assert_eq!(conv.other_participant(&me), Some(&UserId::new("you")));
        assert_eq!(conv.unread_count, 3);
    }

    #[test]
    fn conversation_rejects_negative_unread() {
        let err = conversation_from_value(
            json!({"id": "c1", "otherParticipantId": "you", "unreadCount": -1}),
            &UserId::new("me"),
            now(),
        )
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn unread_update_needs_numeric_total() {
        assert_eq!(parse_unread_update(r#"{"totalUnreadCount":4}"#).unwrap().total_unread_count, 4);
        assert!(parse_unread_update(r#"{"totalUnreadCount":"4"}"#).is_err());
        assert!(parse_unread_update(r"{}").is_err());
    }

    #[test]
    fn read_status_needs_message_id() {
        let update = parse_read_status(r#"{"messageId":"m1","isRead":true}"#).unwrap();
        assert_eq!(update.message_id.as_str(), "m1");
        assert!(parse_read_status(r#"{"isRead":true}"#).is_err());
    }

    #[test]
    fn notification_defaults() {
        let n = parse_notification(r#"{"id":"n1","content":"hello"}"#, now()).unwrap();
        assert!(!n.read);
        assert_eq!(n.created_at, now());
        assert!(parse_notification(r#"{"content":"x"}"#, now()).is_err());
    }

    #[test]
    fn structured_ack() {
        let ack = Ack { kind: AckKind::ConversationRead, ref_id: "c1".into() };
        assert_eq!(parse_status_reply(&serde_json::to_string(&ack).unwrap()), StatusReply::Ack(ack));
    }

    #[test]
    fn legacy_acks() {
        assert_eq!(
            parse_status_reply("mark-read request received for: m9"),
            StatusReply::Ack(Ack { kind: AckKind::MessageRead, ref_id: "m9".into() })
        );
        assert_eq!(
            parse_status_reply("\"mark-conversation-read request received for: c2\""),
            StatusReply::Ack(Ack { kind: AckKind::ConversationRead, ref_id: "c2".into() })
        );
        assert_eq!(
            parse_status_reply("Notification mark-read request received for: n3"),
            StatusReply::Ack(Ack { kind: AckKind::NotificationRead, ref_id: "n3".into() })
        );
        assert_eq!(
            parse_status_reply("Subscribed to chat"),
            StatusReply::Info("Subscribed to chat".into())
        );
    }

    #[test]
    fn error_reply_text() {
        assert_eq!(parse_error_reply(r#"{"message":"nope"}"#), "nope");
        assert_eq!(parse_error_reply(r#"{"error":"bad"}"#), "bad");
        assert_eq!(parse_error_reply("plain"), "plain");
    }
}
