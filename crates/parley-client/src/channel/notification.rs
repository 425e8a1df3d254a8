//! Notification channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_core::{
    Credentials, MonotonicInstant, SubscriptionHandle, Transport, TransportAction,
};
use parley_proto::{
    AckKind, Notification, NotificationId, StatusReply, UserId, destination,
    payload::{parse_error_reply, parse_notification, parse_status_reply},
};

use super::{ChannelKind, require_id};
use crate::{error::ChannelError, event::RealtimeEvent};

/// Confirmation the server pushes to the inbox after subscribing. Not a real
/// notification.
pub const SYSTEM_CONNECTED_NOTICE: &str = "Successfully connected to notification service";

/// Observer for notification deliveries. Every method defaults to a no-op.
pub trait NotificationCallbacks: Send + 'static {
    /// A validated notification arrived.
    fn on_notification(&mut self, _notification: &Notification) {}

    /// The server acknowledged a mark-read.
    fn on_mark_read_ack(&mut self, _id: &NotificationId) {}

    /// Subscriptions were (re)established or lost.
    fn on_connection_change(&mut self, _connected: bool) {}

    /// The server reported an error on the reply queue.
    fn on_error(&mut self, _message: &str) {}
}

impl NotificationCallbacks for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Inbox,
    Status,
    Errors,
}

/// Notification channel manager.
#[derive(Default)]
pub struct NotificationChannel {
    callbacks: Option<Box<dyn NotificationCallbacks>>,
    user: Option<UserId>,
    wanted: bool,
    live: bool,
    routes: HashMap<SubscriptionHandle, Route>,
    events: Vec<RealtimeEvent>,
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("initialized", &self.callbacks.is_some())
            .field("user", &self.user)
            .field("wanted", &self.wanted)
            .field("live", &self.live)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl NotificationChannel {
    const KIND: ChannelKind = ChannelKind::Notification;

    /// Create an uninitialized channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks. Returns `false` (and keeps the first set) if
    /// already initialized.
    pub fn initialize(&mut self, callbacks: impl NotificationCallbacks) -> bool {
        if self.callbacks.is_some() {
            tracing::debug!("notification channel already initialized");
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

    /// Take a lease on the transport and connect it. Subscribes immediately
    /// if the transport is already connected.
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
            (destination::user_topic(&user), Route::Inbox),
            (destination::USER_STATUS.to_string(), Route::Status),
            (destination::USER_ERRORS.to_string(), Route::Errors),
        ];

        for (dest, route) in destinations {
            match transport.subscribe(dest) {
                Ok((handle, subscribe)) => {
                    self.routes.insert(handle, route);
                    actions.extend(subscribe);
                },
                Err(err) => {
                    tracing::warn!(error = %err, "notification subscribe failed");
                    self.routes.clear();
                    return actions;
                },
            }
        }

        match transport.send(destination::NOTIFICATIONS_SUBSCRIBE, "{}", "application/json") {
            Ok(send) => actions.extend(send),
            Err(err) => tracing::warn!(error = %err, "notification subscribe message not sent"),
        }

        tracing::info!(user = %user, "notification channel live");
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
            Route::Inbox => match parse_notification(body, now) {
                Ok(notification) if notification.content == SYSTEM_CONNECTED_NOTICE => {
                    tracing::debug!("skipping connection notice");
                },
                Ok(notification) => {
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_notification(&notification);
                    }
                    self.events.push(RealtimeEvent::NewNotification(notification));
                },
                Err(err) => tracing::warn!(error = %err, "dropping invalid notification"),
            },
            Route::Status => match parse_status_reply(body) {
                StatusReply::Ack(ack) if ack.kind == AckKind::NotificationRead => {
                    let id = NotificationId::new(ack.ref_id);
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_mark_read_ack(&id);
                    }
                    self.events.push(RealtimeEvent::NotificationRead { notification_id: id });
                },
                StatusReply::Ack(ack) => {
                    tracing::debug!(kind = ?ack.kind, "ignoring chat ack on notification queue");
                },
                StatusReply::Info(text) => tracing::debug!(%text, "notification status"),
            },
            Route::Errors => {
                let message = parse_error_reply(body);
                tracing::warn!(%message, "notification error from server");
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_error(&message);
                }
                self.events.push(RealtimeEvent::Error { channel: Some(Self::KIND), message });
            },
        }
        true
    }

    /// Mirror a read over the realtime channel.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Validation` for a blank id (nothing is sent)
    /// - `ChannelError::NotConnected` without a live session
    pub fn mark_as_read<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        id: &NotificationId,
    ) -> Result<Vec<TransportAction>, ChannelError> {
        require_id(id.as_str(), "notificationId")?;
        Ok(transport.send(destination::NOTIFICATIONS_MARK_READ, id.as_str(), "text/plain")?)
    }

    /// Unsubscribe and drop the lease. The last lease disconnects the
    /// transport.
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
