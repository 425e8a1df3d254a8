//! Typed in-tab event bus.
//!
//! Channel managers publish [`RealtimeEvent`]s here instead of calling stores
//! directly; stores and views subscribe. Event names match the ones views
//! already listen for.

use parley_core::ReconnectionStatus;
use parley_proto::{
    ChatMessage, ConversationId, MessageId, Notification, NotificationId, ReadStatusUpdate,
    UnreadCountUpdate,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::ChannelKind;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Realtime and cross-tab events visible to views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "kebab-case")]
pub enum RealtimeEvent {
    /// A notification arrived on the user topic.
    NewNotification(Notification),
    /// The broker acknowledged a notification read.
    #[serde(rename_all = "camelCase")]
    NotificationRead {
        /// Acknowledged notification.
        notification_id: NotificationId,
    },
    /// A chat message arrived.
    #[serde(rename = "websocket-message")]
    ChatMessage(ChatMessage),
    /// The broker acknowledged a message read.
    #[serde(rename = "websocket-message-read", rename_all = "camelCase")]
    MessageRead {
        /// Acknowledged message.
        message_id: MessageId,
        /// Conversation, when known.
        conversation_id: Option<ConversationId>,
    },
    /// Read flag pushed for a message.
    #[serde(rename = "websocket-read-status-update")]
    ReadStatusUpdate(ReadStatusUpdate),
    /// A whole conversation was read.
    #[serde(rename = "websocket-conversation-read", rename_all = "camelCase")]
    ConversationRead {
        /// Conversation marked read.
        conversation_id: ConversationId,
    },
    /// Server pushed a new unread total.
    #[serde(rename = "websocket-unread-count-update")]
    UnreadCountUpdate(UnreadCountUpdate),
    /// Transport reconnection progress.
    #[serde(rename = "websocket-reconnection-status")]
    Reconnection(ReconnectionStatus),
    /// Another tab marked a message read.
    #[serde(rename_all = "camelCase")]
    CrossTabMessageRead {
        /// Conversation of the message.
        conversation_id: ConversationId,
        /// Message marked read.
        message_id: MessageId,
    },
    /// A channel gained or lost its subscriptions.
    #[serde(rename = "websocket-connection-change")]
    ConnectionChange {
        /// Which channel.
        channel: ChannelKind,
        /// Whether it is now live.
        connected: bool,
    },
    /// Broker or transport error worth showing.
    #[serde(rename = "realtime-error")]
    Error {
        /// Channel the error belongs to, if any.
        channel: Option<ChannelKind>,
        /// Human-readable text.
        message: String,
    },
}

impl RealtimeEvent {
    /// Event name as views know it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewNotification(_) => "new-notification",
            Self::NotificationRead { .. } => "notification-read",
            Self::ChatMessage(_) => "websocket-message",
            Self::MessageRead { .. } => "websocket-message-read",
            Self::ReadStatusUpdate(_) => "websocket-read-status-update",
            Self::ConversationRead { .. } => "websocket-conversation-read",
            Self::UnreadCountUpdate(_) => "websocket-unread-count-update",
            Self::Reconnection(_) => "websocket-reconnection-status",
            Self::CrossTabMessageRead { .. } => "cross-tab-message-read",
            Self::ConnectionChange { .. } => "websocket-connection-change",
            Self::Error { .. } => "realtime-error",
        }
    }
}

/// Broadcast bus. Clone is cheap; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    /// Bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus: EventBus<u32> = EventBus::default();
        assert_eq!(bus.publish(1), 0);
    }

    #[test]
    fn every_subscriber_receives() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(RealtimeEvent::ConversationRead { conversation_id: "c1".into() }), 2);
        assert_eq!(a.try_recv().unwrap().name(), "websocket-conversation-read");
        assert_eq!(b.try_recv().unwrap().name(), "websocket-conversation-read");
    }

    #[test]
    fn serialized_tag_matches_name() {
        let events = [
            RealtimeEvent::ConversationRead { conversation_id: "c1".into() },
            RealtimeEvent::NotificationRead { notification_id: "n1".into() },
            RealtimeEvent::ConnectionChange { channel: ChannelKind::Chat, connected: true },
            RealtimeEvent::Error { channel: None, message: "boom".into() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }
}
