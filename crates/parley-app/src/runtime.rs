//! Single-task runtime that executes the Sans-IO actions.
//!
//! The runtime owns the transport, both channels, both stores and the
//! cross-tab synchronizer. Everything runs on one task, so state is never
//! shared between threads:
//!
//! ```text
//!   ParleyHandle ──Command──┐
//!   sockets ──SocketEvent───┤
//!   REST futures ──result───┼──> Runtime ──> TransportAction / StoreAction
//!   other tabs ──CacheChange┤
//!   timer ──────────────────┘
//! ```
//!
//! After every input the runtime pumps: it drains store actions and channel
//! events until neither produces more work.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use parley_client::{
    ApiError, ApiResponse, ChannelError, ChannelKind, ChatChannel, ChatStore, Completed,
    CrossTabMessage, CrossTabSync, DEFAULT_BUS_CAPACITY, EventBus, NotificationChannel,
    NotificationStore, Outcome, RealtimeEvent, RestApi, SocketConnector, SocketEvent, SocketLink,
    StoreAction, StoreError, StoreResult, StoreStatus, Ticket, WireCommand,
};
use parley_core::{
    CacheChange, Environment, IdentityProvider, RetryPolicy, SharedCache, SocketId, TabId,
    Transport, TransportAction, TransportError, TransportEvent, TransportState,
    cache::CacheSubscription, retry_with_backoff,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    ParleyConfig, ParleyHandle,
    command::{ChatOp, ChatSnapshot, Command, NotificationOp, NotificationSnapshot},
};

type Inflight = BoxFuture<'static, (ChannelKind, Ticket, Result<ApiResponse, ApiError>)>;

/// Drives one tab's realtime and store state.
///
/// # Type Parameters
///
/// - `E`: clock, sleep and randomness
/// - `A`: REST executor
/// - `S`: socket connector
pub struct Runtime<E, A, S>
where
    E: Environment,
    A: RestApi,
    S: SocketConnector,
{
    env: E,
    api: A,
    connector: S,
    identity: Arc<dyn IdentityProvider>,
    config: ParleyConfig,
    tab: TabId,
    transport: Transport<E::Instant>,
    notification_channel: NotificationChannel,
    chat_channel: ChatChannel,
    notifications: NotificationStore,
    chat: ChatStore,
    cross_tab: CrossTabSync<E::Instant>,
    cache_changes: CacheSubscription,
    bus: EventBus<RealtimeEvent>,
    sockets: HashMap<SocketId, SocketLink>,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    commands: mpsc::Receiver<Command>,
    inflight: FuturesUnordered<Inflight>,
    waiters: HashMap<(ChannelKind, Ticket), oneshot::Sender<StoreResult<Outcome>>>,
    /// Next REST poll while the chat socket is down.
    poll_at: Option<E::Instant>,
}

impl<E, A, S> Runtime<E, A, S>
where
    E: Environment,
    A: RestApi,
    S: SocketConnector,
{
    /// Create a runtime for a new tab on `cache` and the handle that talks
    /// to it. Nothing happens until [`run`](Self::run) is polled and the
    /// handle calls `start`.
    pub fn new(
        env: E,
        api: A,
        connector: S,
        identity: Arc<dyn IdentityProvider>,
        cache: &SharedCache,
        config: ParleyConfig,
    ) -> (Self, ParleyHandle) {
        let tab = TabId::new(env.random_u64());
        let tab_cache = cache.tab(tab);
        let (command_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(DEFAULT_BUS_CAPACITY);

        let mut notification_channel = NotificationChannel::new();
        notification_channel.initialize(());
        let mut chat_channel = ChatChannel::new();
        chat_channel.initialize(());

        let runtime = Self {
            transport: Transport::new(config.transport.clone()),
            notifications: NotificationStore::new(config.notifications, tab_cache.clone()),
            chat: ChatStore::new(config.chat, tab_cache.clone()),
            cross_tab: CrossTabSync::new(tab_cache.clone()),
            cache_changes: tab_cache.subscribe(),
            env,
            api,
            connector,
            identity,
            config,
            tab,
            notification_channel,
            chat_channel,
            bus: bus.clone(),
            sockets: HashMap::new(),
            socket_tx,
            socket_rx,
            commands,
            inflight: FuturesUnordered::new(),
            waiters: HashMap::new(),
            poll_at: None,
        };
        (runtime, ParleyHandle::new(command_tx, bus))
    }

    /// Cache identity of this tab.
    pub fn tab(&self) -> TabId {
        self.tab
    }

    /// Run until [`ParleyHandle::shutdown`] or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(tab = self.tab.get(), "parley runtime started");

        loop {
            let sleep = self.env.sleep(self.next_wake());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.socket_rx.recv() => self.handle_socket(event),
                Some((kind, ticket, result)) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.complete(kind, ticket, result);
                },
                Some(change) = self.cache_changes.recv() => self.handle_cache_change(&change),
                () = sleep => self.tick(),
            }
            self.pump();
        }

        self.stop();
        tracing::info!(tab = self.tab.get(), "parley runtime stopped");
    }

    fn next_wake(&self) -> Duration {
        let now = self.env.now();
        [self.transport.next_deadline(), self.cross_tab.next_deadline(), self.poll_at]
            .into_iter()
            .flatten()
            .min()
            .map_or(self.config.tick_interval, |at| {
                if at > now { (at - now).min(self.config.tick_interval) } else { Duration::ZERO }
            })
    }

    fn tick(&mut self) {
        let now = self.env.now();
        let actions = self.transport.tick(now);
        self.execute_transport(actions);
        self.cross_tab.tick(now);
        self.poll_fallback(now);
    }

    /// Keep chat counters fresh over REST while the realtime channel is down.
    fn poll_fallback(&mut self, now: E::Instant) {
        if !self.chat.needs_polling() {
            self.poll_at = None;
            return;
        }
        let interval = self.chat.config().poll_interval;
        match self.poll_at {
            None => self.poll_at = Some(now + interval),
            Some(at) if at <= now => {
                let issued = self.chat.poll();
                tracing::debug!(requests = issued.len(), "polling chat while disconnected");
                self.poll_at = Some(now + interval);
            },
            Some(_) => {},
        }
    }

    /// Network reachability changed.
    fn set_online(&mut self, online: bool) {
        tracing::info!(online, "network status changed");
        self.chat.set_online(online);
        if !online || self.chat.status() == StoreStatus::Uninitialized {
            return;
        }
        if matches!(self.transport.state(), TransportState::Connected | TransportState::Connecting)
        {
            return;
        }
        match self.transport.manual_reconnect(self.env.now(), self.env.unix_now()) {
            Ok(actions) => self.execute_transport(actions),
            Err(err) => tracing::warn!(error = %err, "reconnect after coming online failed"),
        }
    }

    fn stop(&mut self) {
        let actions = self.transport.disconnect();
        self.execute_transport(actions);
        for (_, link) in self.sockets.drain() {
            link.close();
        }
        self.cross_tab.clear();
        self.fail_waiters("parley runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            },
            Command::Logout(reply) => {
                tracing::info!("logging out");
                self.notifications.cleanup();
                self.chat.cleanup();
                self.cross_tab.clear();
                self.fail_waiters("session ended");
                let _ = reply.send(());
            },
            Command::Notification(op, reply) => {
                let issued = self.notification_op(op);
                self.await_ticket(ChannelKind::Notification, issued, reply);
            },
            Command::Chat(op, reply) => {
                let issued = self.chat_op(op);
                self.await_ticket(ChannelKind::Chat, issued, reply);
            },
            Command::RemoveNotification(id, reply) => {
                let _ = reply.send(self.notifications.remove_notification(&id));
            },
            Command::MarkMessageRead(id, reply) => {
                let _ = reply.send(self.chat.mark_message_as_read(&id));
            },
            Command::SetActiveConversation(conversation_id) => {
                self.chat.set_active_conversation(conversation_id);
            },
            Command::SetVisible(visible) => {
                self.chat.set_visible(visible);
            },
            Command::SetOnline(online) => self.set_online(online),
            Command::ManualReconnect(reply) => {
                let result = self
                    .transport
                    .manual_reconnect(self.env.now(), self.env.unix_now())
                    .map(|actions| self.execute_transport(actions));
                let _ = reply.send(result);
            },
            Command::NotificationSnapshot(reply) => {
                let _ = reply.send(self.notification_snapshot());
            },
            Command::ChatSnapshot(reply) => {
                let _ = reply.send(self.chat_snapshot());
            },
            Command::Messages(conversation_id, reply) => {
                let _ = reply.send(self.chat.messages(&conversation_id).to_vec());
            },
            Command::Shutdown => {},
        }
    }

    fn start(&mut self) -> StoreResult<()> {
        let credentials = self.identity.credentials()?;
        tracing::info!(user = %credentials.user_id(), "starting session");
        self.notifications.initialize(self.env.wall_clock());
        self.chat.initialize(credentials.user_id().clone());
        Ok(())
    }

    fn notification_op(&mut self, op: NotificationOp) -> StoreResult<Option<Ticket>> {
        let store = &mut self.notifications;
        Ok(match op {
            NotificationOp::Fetch { page, size, append, unread_only } => {
                Some(store.fetch_notifications(page, size, append, unread_only))
            },
            NotificationOp::FetchMore => store.fetch_more(),
            NotificationOp::UnreadCount => Some(store.fetch_unread_count()),
            NotificationOp::MarkRead(id) => Some(store.mark_as_read(&id)?),
            NotificationOp::MarkAllRead => Some(store.mark_all_as_read()),
            NotificationOp::Preferences => Some(store.fetch_preferences()),
            NotificationOp::UpdatePreference { kind, email_enabled, web_push_enabled } => {
                Some(store.update_preference(&kind, email_enabled, web_push_enabled)?)
            },
        })
    }

    fn chat_op(&mut self, op: ChatOp) -> StoreResult<Option<Ticket>> {
        let store = &mut self.chat;
        Ok(match op {
            ChatOp::Conversations => Some(store.fetch_conversations()),
            ChatOp::UnreadCount => Some(store.fetch_unread_count()),
            ChatOp::Messages { conversation_id, page, size, append } => {
                Some(store.fetch_messages(&conversation_id, page, size, append)?)
            },
            ChatOp::MoreMessages(conversation_id) => store.fetch_more_messages(&conversation_id),
            ChatOp::Send(message) => Some(store.send_message(message)?),
            ChatOp::MarkConversationRead(conversation_id) => {
                Some(store.mark_conversation_as_read(&conversation_id)?)
            },
        })
    }

    fn await_ticket(
        &mut self,
        kind: ChannelKind,
        issued: StoreResult<Option<Ticket>>,
        reply: oneshot::Sender<StoreResult<Outcome>>,
    ) {
        match issued {
            Ok(Some(ticket)) => {
                self.waiters.insert((kind, ticket), reply);
            },
            Ok(None) => {
                let _ = reply.send(Ok(Outcome::Done));
            },
            Err(err) => {
                let _ = reply.send(Err(err));
            },
        }
    }

    fn fail_waiters(&mut self, message: &str) {
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(StoreError::new(message)));
        }
    }

    fn notification_snapshot(&self) -> NotificationSnapshot {
        let store = &self.notifications;
        NotificationSnapshot {
            notifications: store.notifications().to_vec(),
            unread_count: store.unread_count(),
            pagination: store.pagination(),
            preferences: store.preferences().to_vec(),
            connected: store.is_connected(),
            loading: store.is_loading(),
            error: store.error().cloned(),
            status: store.status(),
        }
    }

    fn chat_snapshot(&self) -> ChatSnapshot {
        let store = &self.chat;
        ChatSnapshot {
            conversations: store.conversations().to_vec(),
            total_unread: store.total_unread(),
            active_conversation: store.active_conversation().cloned(),
            connected: store.is_connected(),
            online: store.is_online(),
            loading: store.is_loading(),
            error: store.error().cloned(),
            status: store.status(),
        }
    }

    /// Execute queued store actions and route channel events until both are
    /// drained.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;

            for action in self.notifications.take_actions() {
                progressed = true;
                self.execute_store_action(ChannelKind::Notification, action);
            }
            for action in self.chat.take_actions() {
                progressed = true;
                self.execute_store_action(ChannelKind::Chat, action);
            }

            let mut events = self.notification_channel.take_events();
            events.extend(self.chat_channel.take_events());
            for event in events {
                progressed = true;
                self.dispatch(event);
            }

            if !progressed {
                break;
            }
        }
    }

    /// Channel events go to both stores first, then to views.
    fn dispatch(&mut self, event: RealtimeEvent) {
        tracing::debug!(event = event.name(), "dispatching realtime event");
        self.notifications.on_realtime(&event, self.env.wall_clock());
        self.chat.on_realtime(&event);
        self.bus.publish(event);
    }

    fn execute_store_action(&mut self, kind: ChannelKind, action: StoreAction) {
        match action {
            StoreAction::Request { ticket, request, policy } => {
                self.spawn_request(kind, ticket, request, policy);
            },
            StoreAction::Connect(channel) => self.connect_channel(channel),
            StoreAction::Disconnect(channel) => {
                let actions = match channel {
                    ChannelKind::Notification => {
                        self.notification_channel.disconnect(&mut self.transport)
                    },
                    ChannelKind::Chat => self.chat_channel.disconnect(&mut self.transport),
                };
                self.execute_transport(actions);
            },
            StoreAction::Wire { ticket, command } => self.send_wire(ticket, command),
            StoreAction::Publish(event) => {
                self.bus.publish(event);
            },
            StoreAction::Broadcast(message) => self.broadcast(&message),
        }
    }

    fn spawn_request(
        &mut self,
        kind: ChannelKind,
        ticket: Ticket,
        request: parley_client::ApiRequest,
        policy: RetryPolicy,
    ) {
        let credentials = match self.identity.credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(%ticket, error = %err, "no session for request");
                let result = Err(ApiError::Unauthorized { message: err.to_string() });
                self.complete(kind, ticket, result);
                return;
            },
        };

        let env = self.env.clone();
        let api = self.api.clone();
        self.inflight.push(Box::pin(async move {
            let outcome = retry_with_backoff(&env, &policy, |attempt| {
                tracing::debug!(%ticket, attempt, path = %request.path(), "executing request");
                api.execute(&credentials, &request)
            })
            .await;
            (kind, ticket, outcome.into_result())
        }));
    }

    fn complete(
        &mut self,
        kind: ChannelKind,
        ticket: Ticket,
        result: Result<ApiResponse, ApiError>,
    ) {
        if let Err(err) = &result
            && err.requires_login()
        {
            tracing::warn!(%ticket, "request unauthorized");
        }

        let wall = self.env.wall_clock();
        let done = match kind {
            ChannelKind::Notification => self.notifications.complete(ticket, result, wall),
            ChannelKind::Chat => self.chat.complete(ticket, result, wall),
        };
        if let Some(done) = done {
            self.reply(kind, done);
        }
    }

    fn reply(&mut self, kind: ChannelKind, done: Completed) {
        if let Some(reply) = self.waiters.remove(&(kind, done.ticket)) {
            let _ = reply.send(done.result);
        }
    }

    fn connect_channel(&mut self, kind: ChannelKind) {
        let credentials = match self.identity.credentials() {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(channel = ?kind, error = %err, "cannot connect without a session");
                self.bus.publish(RealtimeEvent::Error { channel: Some(kind), message: err.to_string() });
                return;
            },
        };

        let now = self.env.now();
        let unix_now = self.env.unix_now();
        let endpoint = self.config.endpoint.clone();
        let result = match kind {
            ChannelKind::Notification => self.notification_channel.connect(
                &mut self.transport,
                credentials,
                &endpoint,
                now,
                unix_now,
            ),
            ChannelKind::Chat => {
                self.chat_channel.connect(&mut self.transport, credentials, &endpoint, now, unix_now)
            },
        };

        match result {
            Ok(actions) => self.execute_transport(actions),
            Err(err) => {
                tracing::warn!(channel = ?kind, error = %err, "channel connect failed");
                if err.is_auth() {
                    self.identity.invalidate();
                }
                self.bus.publish(RealtimeEvent::Error { channel: Some(kind), message: err.to_string() });
            },
        }
    }

    fn send_wire(&mut self, ticket: Option<Ticket>, command: WireCommand) {
        let transport = &mut self.transport;
        let result = match &command {
            WireCommand::MarkNotificationRead(id) => {
                self.notification_channel.mark_as_read(transport, id)
            },
            WireCommand::SendChat(message) => self.chat_channel.send_message(transport, message),
            WireCommand::MarkMessageRead(id) => self.chat_channel.mark_message_read(transport, id),
            WireCommand::MarkConversationRead(id) => {
                self.chat_channel.mark_conversation_read(transport, id)
            },
            WireCommand::Ping => self.chat_channel.ping(transport),
        };

        let status: Result<(), ChannelError> = match result {
            Ok(actions) => {
                self.execute_transport(actions);
                Ok(())
            },
            Err(err) => {
                tracing::debug!(?command, error = %err, "realtime send failed");
                Err(err)
            },
        };

        if let Some(ticket) = ticket
            && let Some(done) = self.chat.wire_result(ticket, status)
        {
            self.reply(ChannelKind::Chat, done);
        }
    }

    fn broadcast(&mut self, message: &CrossTabMessage) {
        if let Err(err) = self.cross_tab.broadcast(message, self.env.now(), self.env.wall_clock()) {
            tracing::warn!(error = %err, "cross-tab broadcast failed");
        }
    }

    fn handle_cache_change(&mut self, change: &CacheChange) {
        let Some(message) = CrossTabMessage::decode(change, self.env.wall_clock()) else {
            return;
        };
        tracing::debug!(key = %change.key, origin = change.origin.get(), "applying cross-tab change");
        match message.channel() {
            ChannelKind::Notification => self.notifications.apply_remote(&message),
            ChannelKind::Chat => self.chat.apply_remote(&message),
        }
    }

    fn handle_socket(&mut self, event: SocketEvent) {
        let now = self.env.now();
        let actions = match event {
            SocketEvent::Opened(socket) => self.transport.on_socket_open(socket, now),
            SocketEvent::Data(socket, data) => {
                match self.transport.on_socket_data(socket, &data, now) {
                    Ok(actions) => actions,
                    Err(err) => {
                        tracing::warn!(socket = socket.get(), error = %err, "dropping inbound frame");
                        vec![]
                    },
                }
            },
            SocketEvent::Closed(socket, reason) => {
                self.sockets.remove(&socket);
                self.transport.on_socket_closed(socket, now, &reason)
            },
        };
        self.execute_transport(actions);
    }

    fn execute_transport(&mut self, actions: Vec<TransportAction>) {
        for action in actions {
            match action {
                TransportAction::OpenSocket { socket, endpoint } => {
                    let link = self.connector.open(socket, &endpoint, self.socket_tx.clone());
                    self.sockets.insert(socket, link);
                },
                TransportAction::SendFrame { socket, frame } => self.write(socket, frame.encode()),
                TransportAction::SendHeartbeat { socket } => self.write(socket, b"\n".to_vec()),
                TransportAction::CloseSocket { socket } => {
                    if let Some(link) = self.sockets.remove(&socket) {
                        link.close();
                    }
                },
                TransportAction::Emit(event) => self.handle_transport_event(event),
            }
        }
    }

    fn write(&mut self, socket: SocketId, data: Vec<u8>) {
        match self.sockets.get(&socket) {
            Some(link) if link.send(data) => {},
            _ => tracing::debug!(socket = socket.get(), "write to closed socket dropped"),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { reconnected } => {
                tracing::info!(reconnected, "realtime session established");
                let actions = self.notification_channel.on_connected(&mut self.transport);
                self.execute_transport(actions);
                let actions = self.chat_channel.on_connected(&mut self.transport);
                self.execute_transport(actions);
            },
            TransportEvent::Disconnected { reason, will_retry } => {
                tracing::info!(%reason, will_retry, "realtime session lost");
                self.notification_channel.on_disconnected();
                self.chat_channel.on_disconnected();
            },
            TransportEvent::Reconnection(status) => {
                self.dispatch(RealtimeEvent::Reconnection(status));
            },
            TransportEvent::Message { subscription, destination, body } => {
                let wall = self.env.wall_clock();
                let handled = self.notification_channel.handle_delivery(subscription, &body, wall)
                    || self.chat_channel.handle_delivery(subscription, &body, wall);
                if !handled {
                    tracing::debug!(%destination, "delivery for unknown subscription");
                }
            },
            TransportEvent::ServerError { message } => {
                self.dispatch(RealtimeEvent::Error { channel: None, message });
            },
            TransportEvent::Failed(err) => {
                tracing::error!(error = %err, "realtime transport failed");
                if matches!(err, TransportError::Auth(_)) {
                    self.identity.invalidate();
                }
                self.dispatch(RealtimeEvent::Error { channel: None, message: err.to_string() });
            },
        }
    }
}
