//! Chat channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_core::{
    Credentials, MonotonicInstant, SubscriptionHandle, Transport, TransportAction,
};
use parley_proto::{
    Ack, AckKind, ChatMessage, ConversationId, MessageId, OutgoingMessage, ReadStatusUpdate,
    StatusReply, UnreadCountUpdate, UserId, destination,
    payload::{
        parse_chat_message, parse_error_reply, parse_read_status, parse_status_reply,
        parse_unread_update,
    },
};

use super::{ChannelKind, require_id, validate_outgoing};
use crate::{error::ChannelError, event::RealtimeEvent};

/// Observer for chat deliveries. Every method defaults to a no-op.
pub trait ChatCallbacks: Send + 'static {
    /// A validated message arrived.
    fn on_message(&mut self, _message: &ChatMessage) {}

    /// A read receipt arrived.
    fn on_read_status_update(&mut self, _update: &ReadStatusUpdate) {}

    /// The server pushed a new unread total.
    fn on_unread_count_update(&mut self, _update: &UnreadCountUpdate) {}

    /// The server acknowledged a message or conversation read.
    fn on_ack(&mut self, _ack: &Ack) {}

    /// Subscriptions were (re)established or lost.
    fn on_connection_change(&mut self, _connected: bool) {}

    /// The server reported an error on the reply queue.
    fn on_error(&mut self, _message: &str) {}
}

impl ChatCallbacks for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Messages,
    Unread,
    ReadStatus,
    Status,
    Errors,
}

/// Chat channel manager.
#[derive(Default)]
pub struct ChatChannel {
    callbacks: Option<Box<dyn ChatCallbacks>>,
    user: Option<UserId>,
    wanted: bool,
    live: bool,
    routes: HashMap<SubscriptionHandle, Route>,
    events: Vec<RealtimeEvent>,
}

impl std::fmt::Debug for ChatChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatChannel")
            .field("initialized", &self.callbacks.is_some())
            .field("user", &self.user)
            .field("wanted", &self.wanted)
            .field("live", &self.live)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl ChatChannel {
    const KIND: ChannelKind = ChannelKind::Chat;

    /// Create an uninitialized channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks. Returns `false` if already initialized.
    pub fn initialize(&mut self, callbacks: impl ChatCallbacks) -> bool {
        if self.callbacks.is_some() {
            tracing::debug!("chat channel already initialized");
            return false;
        }
        self.callbacks = Some(Box::new(callbacks));
        true
    }

    /// Whether `initialize` has run.
    pub fn is_initialized(&self) -> bool {
        self.callbacks.is_some()
    }

    /// Whether the subscriptions are live.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Whether a connect was requested and not yet undone.
    pub fn is_wanted(&self) -> bool {
        self.wanted
    }

    /// Whether `handle` belongs to this channel.
    pub fn owns(&self, handle: SubscriptionHandle) -> bool {
        self.routes.contains_key(&handle)
    }

    /// Local user, once connected.
    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Take a lease on the transport and connect it.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotInitialized` before `initialize`
    /// - `ChannelError::Transport` if the credentials are rejected locally
    pub fn connect<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        credentials: Credentials,
        endpoint: &str,
        now: I,
        unix_now: i64,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        if self.callbacks.is_none() {
            return Err(ChannelError::NotInitialized);
        }

        let user = credentials.user_id().clone();
        let mut actions = transport.connect(credentials, endpoint, now, unix_now)?;
        self.user = Some(user);
        self.wanted = true;
        transport.acquire(Self::KIND.lease_name());

        if transport.is_connected() && !self.live {
            actions.extend(self.on_connected(transport));
        }
        Ok(actions)
    }

    /// Subscribe the per-user set. Called on every (re)connect.
    pub fn on_connected<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
    ) -> Vec<TransportAction> {
        let Some(user) = self.user.clone().filter(|_| self.wanted) else {
            return vec![];
        };

        self.routes.clear();
        let mut actions = Vec::new();
        let destinations = [
            (destination::chat_topic(&user), Route::Messages),
            (destination::chat_unread_topic(&user), Route::Unread),
            (destination::chat_read_status_topic(&user), Route::ReadStatus),
            (destination::CHAT_STATUS.to_string(), Route::Status),
            (destination::CHAT_ERRORS.to_string(), Route::Errors),
        ];

        for (dest, route) in destinations {
            match transport.subscribe(dest) {
                Ok((handle, subscribe)) => {
                    self.routes.insert(handle, route);
                    actions.extend(subscribe);
                },
                Err(err) => {
                    tracing::warn!(error = %err, "chat subscribe failed");
                    self.routes.clear();
                    return actions;
                },
            }
        }

        match transport.send(destination::CHAT_SUBSCRIBE, "{}", "application/json") {
            Ok(send) => actions.extend(send),
            Err(err) => tracing::warn!(error = %err, "chat subscribe message not sent"),
        }

        tracing::info!(user = %user, "chat channel live");
        self.set_live(true);
        actions
    }

    /// The transport lost its session; subscriptions are gone.
    pub fn on_disconnected(&mut self) {
        self.routes.clear();
        self.set_live(false);
    }

    /// Process a delivery. Returns `false` if the subscription is not ours.
    pub fn handle_delivery(
        &mut self,
        handle: SubscriptionHandle,
        body: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(route) = self.routes.get(&handle).copied() else {
            return false;
        };

        match route {
            Route::Messages => match parse_chat_message(body, now) {
                Ok(message) => {
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_message(&message);
                    }
                    self.events.push(RealtimeEvent::ChatMessage(message));
                },
                Err(err) => tracing::warn!(error = %err, "dropping invalid chat message"),
            },
            Route::Unread => match parse_unread_update(body) {
                Ok(update) => {
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_unread_count_update(&update);
                    }
                    self.events.push(RealtimeEvent::UnreadCountUpdate(update));
                },
                Err(err) => tracing::warn!(error = %err, "dropping invalid unread update"),
            },
            Route::ReadStatus => match parse_read_status(body) {
                Ok(update) => {
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_read_status_update(&update);
                    }
                    self.events.push(RealtimeEvent::ReadStatusUpdate(update));
                },
                Err(err) => tracing::warn!(error = %err, "dropping invalid read status"),
            },
            Route::Status => match parse_status_reply(body) {
                StatusReply::Ack(ack) => self.handle_ack(ack),
                StatusReply::Info(text) => tracing::debug!(%text, "chat status"),
            },
            Route::Errors => {
                let message = parse_error_reply(body);
                tracing::warn!(%message, "chat error from server");
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_error(&message);
                }
                self.events.push(RealtimeEvent::Error { channel: Some(Self::KIND), message });
            },
        }
        true
    }

    fn handle_ack(&mut self, ack: Ack) {
        let event = match ack.kind {
            AckKind::MessageRead => RealtimeEvent::MessageRead {
                message_id: MessageId::new(ack.ref_id.clone()),
                conversation_id: None,
            },
            AckKind::ConversationRead => RealtimeEvent::ConversationRead {
                conversation_id: ConversationId::new(ack.ref_id.clone()),
            },
            AckKind::NotificationRead => {
                tracing::debug!("ignoring notification ack on chat queue");
                return;
            },
        };
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_ack(&ack);
        }
        self.events.push(event);
    }

    /// Send a message over the realtime channel.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Validation` for invalid input (nothing is sent)
    /// - `ChannelError::NotConnected` without a live session; the caller
    ///   falls back to REST
    /// - `ChannelError::Encode` if the body cannot be serialized
    pub fn send_message<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        message: &OutgoingMessage,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        validate_outgoing(message, self.user.as_ref())?;
        let body =
            serde_json::to_string(message).map_err(|err| ChannelError::Encode(err.to_string()))?;
        Ok(transport.send(destination::CHAT_SEND, body, "application/json")?)
    }

    /// Mirror a message read.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Validation` for a blank id
    /// - `ChannelError::NotConnected` without a live session
    pub fn mark_message_read<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        id: &MessageId,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        require_id(id.as_str(), "messageId")?;
        Ok(transport.send(destination::CHAT_MARK_READ, id.as_str(), "text/plain")?)
    }

    /// Mirror a conversation read.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Validation` for a blank id
    /// - `ChannelError::NotConnected` without a live session
    pub fn mark_conversation_read<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        id: &ConversationId,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        require_id(id.as_str(), "conversationId")?;
        Ok(transport.send(destination::CHAT_MARK_CONVERSATION_READ, id.as_str(), "text/plain")?)
    }

    /// Application-level liveness probe; the reply lands on the status queue.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotConnected` without a live session
    pub fn ping<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        Ok(transport.send(destination::CHAT_PING, "{}", "application/json")?)
    }

    /// Unsubscribe and drop the lease.
    pub fn disconnect<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
    ) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        for handle in self.routes.keys().copied().collect::<Vec<_>>() {
            actions.extend(transport.unsubscribe(handle));
        }
        self.on_disconnected();
        self.wanted = false;
        actions.extend(transport.release(Self::KIND.lease_name()));
        actions
    }

    /// Drain queued events.
    pub fn take_events(&mut self) -> Vec<RealtimeEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_live(&mut self, live: bool) {
        if self.live == live {
            return;
        }
        self.live = live;
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_connection_change(live);
        }
        self.events.push(RealtimeEvent::ConnectionChange { channel: Self::KIND, connected: live });
    }
}
