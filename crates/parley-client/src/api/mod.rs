//! REST request/response model.
//!
//! Stores describe REST work as [`ApiRequest`] values; a [`RestApi`]
//! implementation executes them. Responses use the backend envelope:
//!
//! ```text
//! { "data": ..., "error": {"code", "message"}, "message": ...,
//!   "metadata": {"pageNumber", "pageSize", "totalCount", "totalPages"} }
//! ```

#[cfg(feature = "http")]
mod http;

use std::future::Future;

use chrono::{DateTime, Utc};
use parley_core::Credentials;
use parley_proto::{
    ChatMessage, Conversation, ConversationId, Notification, NotificationId,
    NotificationPreference, OutgoingMessage, ParseError, UserId,
    payload::{
        chat_message_from_value, conversation_from_value, notification_from_value,
        preference_from_value,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[cfg(feature = "http")]
pub use self::http::HttpApi;
use crate::error::ApiError;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
}

/// One REST call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    /// `GET /notifications/`
    Notifications {
        /// Zero-based page.
        page: u32,
        /// Page size.
        size: u32,
        /// Only unread notifications.
        unread_only: bool,
    },
    /// `GET /notifications/unread-count`
    NotificationUnreadCount,
    /// `PUT /notifications/{id}/read`
    MarkNotificationRead(NotificationId),
    /// `PUT /notifications/mark-all-read`
    MarkAllNotificationsRead,
    /// `GET /notifications/preferences`
    NotificationPreferences,
    /// `PUT /notifications/preferences/{type}`
    UpdatePreference {
        /// Notification category.
        kind: String,
        /// Deliver by email.
        email_enabled: bool,
        /// Deliver as web push.
        web_push_enabled: bool,
    },
    /// `GET /chat/conversations`
    Conversations,
    /// `GET /chat/conversations/{id}/messages`
    Messages {
        /// Conversation.
        conversation_id: ConversationId,
        /// Zero-based page.
        page: u32,
        /// Page size.
        size: u32,
    },
    /// `POST /chat/send`
    SendMessage(OutgoingMessage),
    /// `PUT /chat/conversations/{id}/read`
    MarkConversationRead(ConversationId),
    /// `GET /chat/unread-count`
    ChatUnreadCount,
}

impl ApiRequest {
    /// HTTP method.
    pub fn method(&self) -> Method {
        match self {
            Self::Notifications { .. }
            | Self::NotificationUnreadCount
            | Self::NotificationPreferences
            | Self::Conversations
            | Self::Messages { .. }
            | Self::ChatUnreadCount => Method::Get,
            Self::SendMessage(_) => Method::Post,
            Self::MarkNotificationRead(_)
            | Self::MarkAllNotificationsRead
            | Self::UpdatePreference { .. }
            | Self::MarkConversationRead(_) => Method::Put,
        }
    }

    /// Path relative to the API base URL.
    pub fn path(&self) -> String {
        match self {
            Self::Notifications { .. } => "/notifications/".to_string(),
            Self::NotificationUnreadCount => "/notifications/unread-count".to_string(),
            Self::MarkNotificationRead(id) => format!("/notifications/{id}/read"),
            Self::MarkAllNotificationsRead => "/notifications/mark-all-read".to_string(),
            Self::NotificationPreferences => "/notifications/preferences".to_string(),
            Self::UpdatePreference { kind, .. } => format!("/notifications/preferences/{kind}"),
            Self::Conversations => "/chat/conversations".to_string(),
            Self::Messages { conversation_id, .. } => {
                format!("/chat/conversations/{conversation_id}/messages")
            },
            Self::SendMessage(_) => "/chat/send".to_string(),
            Self::MarkConversationRead(id) => format!("/chat/conversations/{id}/read"),
            Self::ChatUnreadCount => "/chat/unread-count".to_string(),
        }
    }

    /// Query parameters.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Notifications { page, size, unread_only } => vec![
                ("page", page.to_string()),
                ("size", size.to_string()),
                ("unreadOnly", unread_only.to_string()),
            ],
            Self::Messages { page, size, .. } => {
                vec![("page", page.to_string()), ("size", size.to_string())]
            },
            _ => vec![],
        }
    }

    /// JSON body, if the call has one.
    pub fn body(&self) -> Option<Value> {
        match self {
            Self::UpdatePreference { email_enabled, web_push_enabled, .. } => Some(json!({
                "emailEnabled": email_enabled,
                "webPushEnabled": web_push_enabled,
            })),
            Self::SendMessage(message) => serde_json::to_value(message).ok(),
            _ => None,
        }
    }

    /// Decode a response to this request.
    ///
    /// # Errors
    ///
    /// - `ApiError::Unauthorized` / `NotFound` / `Status` for non-2xx
    ///   statuses, carrying the envelope's error message
    /// - `ApiError::Decode` if a 2xx body is not JSON
    pub fn decode(&self, status: u16, body: &str) -> Result<ApiResponse, ApiError> {
        let trimmed = body.trim();
        let value: Option<Value> =
            if trimmed.is_empty() { None } else { serde_json::from_str(trimmed).ok() };

        if !(200..300).contains(&status) {
            let message = value.as_ref().and_then(error_message).unwrap_or_default();
            return Err(ApiError::from_status(status, message));
        }

        let Some(value) = value else {
            if trimmed.is_empty() {
                return Ok(ApiResponse::default());
            }
            return Err(ApiError::Decode(format!("{} returned a non-JSON body", self.path())));
        };

        let envelope: Envelope = match &value {
            Value::Object(map) if map.contains_key("data") || map.contains_key("error") => {
                serde_json::from_value(value.clone())
                    .map_err(|e| ApiError::Decode(e.to_string()))?
            },
            _ => Envelope { data: value, ..Envelope::default() },
        };

        if let Some(error) = envelope.error.filter(|e| !e.message.is_empty()) {
            return Err(ApiError::from_status(status.max(400), error.message));
        }

        Ok(ApiResponse { data: envelope.data, metadata: envelope.metadata, message: envelope.message })
    }
}

fn error_message(value: &Value) -> Option<String> {
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<EnvelopeError>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Option<PageMetadata>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    message: String,
}

/// Pagination metadata from the envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageMetadata {
    /// Zero-based page returned.
    pub page_number: u32,
    /// Requested size.
    pub page_size: u32,
    /// Items across all pages.
    pub total_count: u64,
    /// Number of pages.
    pub total_pages: u32,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items in server order.
    pub items: Vec<T>,
    /// Zero-based page.
    pub page: u32,
    /// Number of pages, when known.
    pub total_pages: Option<u32>,
    /// Whether a further page exists.
    pub has_more: bool,
}

/// Decoded success envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    /// `data` field, or the whole body for bare responses.
    pub data: Value,
    /// Pagination metadata.
    pub metadata: Option<PageMetadata>,
    /// Informational message.
    pub message: Option<String>,
}

impl ApiResponse {
    /// Wrap bare data.
    pub fn from_data(data: Value) -> Self {
        Self { data, ..Self::default() }
    }

    /// Attach pagination metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: PageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Unread counter from `unreadCount`, `totalUnreadCount` or a bare number.
    ///
    /// # Errors
    ///
    /// - `ApiError::Decode` if no non-negative count is present
    pub fn count(&self) -> Result<u32, ApiError> {
        let field = |key: &str| self.data.get(key).and_then(Value::as_u64);
        field("totalUnreadCount")
            .or_else(|| field("unreadCount"))
            .or_else(|| self.data.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ApiError::Decode(format!("no unread count in {}", self.data)))
    }

    /// Notification page. Invalid entries are dropped.
    ///
    /// # Errors
    ///
    /// - `ApiError::Decode` if there is no list
    pub fn notifications(
        &self,
        page: u32,
        size: u32,
        now: DateTime<Utc>,
    ) -> Result<Page<Notification>, ApiError> {
        let items = self.list("notifications", |v| notification_from_value(v, now))?;
        Ok(self.page(items, page, size))
    }

    /// Message page. Invalid entries are dropped.
    ///
    /// # Errors
    ///
    /// - `ApiError::Decode` if there is no list
    pub fn messages(
        &self,
        page: u32,
        size: u32,
        now: DateTime<Utc>,
    ) -> Result<Page<ChatMessage>, ApiError> {
        let items = self.list("messages", |v| chat_message_from_value(v, now))?;
        Ok(self.page(items, page, size))
    }

    /// Conversation list. Invalid entries are dropped.
    ///
    /// # Errors
    ///
    /// - `ApiError::Decode` if there is no list
    pub fn conversations(
        &self,
        me: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, ApiError> {
        self.list("conversations", |v| conversation_from_value(v, me, now))
    }

    /// Preference list. Invalid entries are dropped.
    ///
    /// # Errors
    ///
    /// - `ApiError::Decode` if there is no list
    pub fn preferences(&self) -> Result<Vec<NotificationPreference>, ApiError> {
        self.list("preferences", preference_from_value)
    }

    /// Message returned by a send, if the server echoed one.
    pub fn sent_message(&self, now: DateTime<Utc>) -> Option<ChatMessage> {
        let value = match self.data.get("message") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => self.data.clone(),
        };
        if !value.is_object() {
            return None;
        }
        chat_message_from_value(value, now)
            .inspect_err(|e| tracing::warn!(error = %e, "send response without a valid message"))
            .ok()
    }

    fn list<T>(
        &self,
        key: &str,
        parse: impl Fn(Value) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ApiError> {
        let raw = match (&self.data, self.data.get(key)) {
            (_, Some(Value::Array(items))) | (Value::Array(items), None) => items,
            (Value::Null, None) | (_, Some(Value::Null)) => return Ok(vec![]),
            _ => return Err(ApiError::Decode(format!("expected a `{key}` list"))),
        };

        Ok(raw
            .iter()
            .filter_map(|item| {
                parse(item.clone())
                    .inspect_err(|e| tracing::warn!(key, error = %e, "dropping invalid entry"))
                    .ok()
            })
            .collect())
    }

    fn page<T>(&self, items: Vec<T>, requested: u32, size: u32) -> Page<T> {
        let field = |key: &str| {
            self.data.get(key).and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok())
        };

        let page = self.metadata.map(|m| m.page_number).or_else(|| field("currentPage"));
        let page = page.unwrap_or(requested);
        let total_pages = self.metadata.map(|m| m.total_pages).or_else(|| field("totalPages"));

        let has_more = match total_pages {
            Some(total) => page.saturating_add(1) < total,
            None => size > 0 && items.len() >= size as usize,
        };

        Page { items, page, total_pages, has_more }
    }
}

/// Executes REST calls.
///
/// Implementations perform exactly one attempt; retries are the caller's
/// concern.
pub trait RestApi: Clone + Send + Sync + 'static {
    /// Perform `request` on behalf of `credentials`.
    fn execute(
        &self,
        credentials: &Credentials,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send;
}
