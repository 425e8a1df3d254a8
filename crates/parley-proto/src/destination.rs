//! Broker destinations.
//!
//! Per-user topics are derived from the user id; queues under `/user/queue`
//! are resolved by the broker to the authenticated session. Application
//! destinations (`/app/...`) are handled by server controllers.

use crate::ids::UserId;

/// Reply queue for notification-side errors.
pub const USER_ERRORS: &str = "/user/queue/errors";
/// Reply queue for notification-side acknowledgments.
pub const USER_STATUS: &str = "/user/queue/status";
/// Reply queue for chat acknowledgments.
pub const CHAT_STATUS: &str = "/user/queue/chat-status";
/// Reply queue for chat errors.
pub const CHAT_ERRORS: &str = "/user/queue/chat-errors";

/// Announce interest in notifications after subscribing.
pub const NOTIFICATIONS_SUBSCRIBE: &str = "/app/notifications/subscribe";
/// Mark one notification read (body: raw id).
pub const NOTIFICATIONS_MARK_READ: &str = "/app/notifications/mark-read";
/// Announce interest in chat after subscribing.
pub const CHAT_SUBSCRIBE: &str = "/app/chat/subscribe";
/// Send a chat message (body: JSON `{receiverId, content}`).
pub const CHAT_SEND: &str = "/app/chat/send";
/// Mark one message read (body: raw id).
pub const CHAT_MARK_READ: &str = "/app/chat/mark-read";
/// Mark a whole conversation read (body: raw id).
pub const CHAT_MARK_CONVERSATION_READ: &str = "/app/chat/mark-conversation-read";
/// Application-level liveness probe.
pub const CHAT_PING: &str = "/app/chat/ping";

/// Per-user notification inbox.
pub fn user_topic(user: &UserId) -> String {
    format!("/topic/user-{user}")
}

/// Per-user chat message inbox.
pub fn chat_topic(user: &UserId) -> String {
    format!("/topic/chat-{user}")
}

/// Per-user chat unread counter updates.
pub fn chat_unread_topic(user: &UserId) -> String {
    format!("/topic/chat-unread-{user}")
}

/// Per-user read receipts for messages the user sent.
pub fn chat_read_status_topic(user: &UserId) -> String {
    format!("/topic/chat-read-status-{user}")
}
