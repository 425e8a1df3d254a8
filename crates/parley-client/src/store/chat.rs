//! Chat store.
//!
//! Holds conversations, per-conversation message lists in chronological
//! order and the unread counters. Every unread change goes through
//! [`ChatStore::set_conversation_unread`] (or the counter helpers built on
//! it), which keeps `Conversation::unread_count`, the per-conversation scope
//! and the global total in step.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use parley_core::{
    ReconnectionStatus, RetryPolicy, TabCache,
    cache::{CONVERSATIONS_KEY, MESSAGES_KEY_PREFIX},
};
use parley_proto::{
    ChatMessage, Conversation, ConversationId, MessageId, OutgoingMessage, UserId,
};

use super::{
    Completed, Outcome, Pagination, SeenIds, StoreAction, StoreStatus, Ticket, TicketBook,
};
use crate::{
    api::{ApiRequest, ApiResponse, Page},
    channel::{ChannelKind, WireCommand, require_id, validate_outgoing},
    counters::UnreadCounters,
    cross_tab::CrossTabMessage,
    error::{ApiError, ChannelError, StoreError, StoreResult},
    event::RealtimeEvent,
};

/// Chat store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatStoreConfig {
    /// Messages kept per conversation; the oldest are evicted.
    pub max_messages: usize,
    /// Conversations written to the cache.
    pub persisted_conversations: usize,
    /// Messages per conversation written to the cache.
    pub persisted_messages: usize,
    /// Default message page size.
    pub page_size: u32,
    /// Message ids remembered per conversation after eviction, so a late
    /// redelivery is still recognised.
    pub seen_messages: usize,
    /// REST polling period while the realtime channel is down.
    pub poll_interval: Duration,
    /// REST retry policy.
    pub retry: RetryPolicy,
}

impl Default for ChatStoreConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            persisted_conversations: 50,
            persisted_messages: 50,
            page_size: 50,
            seen_messages: 1000,
            poll_interval: Duration::from_secs(30),
            retry: RetryPolicy::chat_store(),
        }
    }
}

#[derive(Debug)]
enum Op {
    UnreadCount,
    Conversations,
    Messages { conversation_id: ConversationId, page: u32, size: u32, append: bool },
    Send(#[allow(dead_code)] OutgoingMessage),
    SendRealtime(OutgoingMessage),
    MarkConversationRead,
}

fn messages_key(conversation_id: &ConversationId) -> String {
    format!("{MESSAGES_KEY_PREFIX}{conversation_id}")
}

/// Canonical chat state for one tab.
#[derive(Debug)]
pub struct ChatStore {
    config: ChatStoreConfig,
    cache: TabCache,
    me: Option<UserId>,
    status: StoreStatus,
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<ChatMessage>>,
    seen: HashMap<ConversationId, SeenIds<MessageId>>,
    pagination: HashMap<ConversationId, Pagination>,
    counters: UnreadCounters<ConversationId>,
    active: Option<ConversationId>,
    visible: bool,
    connected: bool,
    online: bool,
    loading: bool,
    error: Option<StoreError>,
    queued_receipts: Vec<WireCommand>,
    refreshing: Option<Ticket>,
    init_ticket: Option<Ticket>,
    tickets: TicketBook<Op>,
    actions: Vec<StoreAction>,
}

impl ChatStore {
    /// Empty store persisting through `cache`.
    pub fn new(config: ChatStoreConfig, cache: TabCache) -> Self {
        Self {
            config,
            cache,
            me: None,
            status: StoreStatus::Uninitialized,
            conversations: Vec::new(),
            messages: HashMap::new(),
            seen: HashMap::new(),
            pagination: HashMap::new(),
            counters: UnreadCounters::new(),
            active: None,
            visible: true,
            connected: false,
            online: true,
            loading: false,
            error: None,
            queued_receipts: Vec::new(),
            refreshing: None,
            init_ticket: None,
            tickets: TicketBook::default(),
            actions: Vec::new(),
        }
    }

    /// Tuning this store was built with.
    pub fn config(&self) -> &ChatStoreConfig {
        &self.config
    }

    /// Conversations, most recently active first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// One conversation.
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == *id)
    }

    /// Messages of a conversation in non-decreasing `created_at` order.
    pub fn messages(&self, id: &ConversationId) -> &[ChatMessage] {
        self.messages.get(id).map_or(&[], Vec::as_slice)
    }

    /// Every conversation with loaded messages.
    pub fn message_threads(&self) -> impl Iterator<Item = (&ConversationId, &[ChatMessage])> {
        self.messages.iter().map(|(id, list)| (id, list.as_slice()))
    }

    /// Pagination cursor of a conversation.
    pub fn pagination(&self, id: &ConversationId) -> Pagination {
        self.pagination.get(id).copied().unwrap_or_default()
    }

    /// Global unread total.
    pub fn total_unread(&self) -> u32 {
        self.counters.total()
    }

    /// Unread count of one conversation.
    pub fn unread_count(&self, id: &ConversationId) -> u32 {
        self.counters.get(id)
    }

    /// The counters themselves.
    pub fn counters(&self) -> &UnreadCounters<ConversationId> {
        &self.counters
    }

    /// Conversation the user has open.
    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Whether the page is visible.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether the realtime channel is live.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the network is reported reachable.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Whether REST polling stands in for the realtime channel: the store
    /// is initialized and online but the channel is down.
    pub fn needs_polling(&self) -> bool {
        self.status != StoreStatus::Uninitialized && self.me.is_some() && self.online && !self.connected
    }

    /// Whether a conversation or message fetch is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Last error.
    pub fn error(&self) -> Option<&StoreError> {
        self.error.as_ref()
    }

    /// Lifecycle state.
    pub fn status(&self) -> StoreStatus {
        self.status
    }

    /// Local user, once initialized.
    pub fn user_id(&self) -> Option<&UserId> {
        self.me.as_ref()
    }

    /// Outstanding tickets.
    pub fn pending_requests(&self) -> usize {
        self.tickets.len()
    }

    /// Read receipts waiting for a connection.
    pub fn queued_receipts(&self) -> &[WireCommand] {
        &self.queued_receipts
    }

    /// Drain queued actions.
    pub fn take_actions(&mut self) -> Vec<StoreAction> {
        std::mem::take(&mut self.actions)
    }

    /// Load the cache, connect the channel and fetch the unread total and
    /// conversations. Safe to call again.
    pub fn initialize(&mut self, me: UserId) -> Vec<Ticket> {
        tracing::info!(user = %me, status = ?self.status, "initializing chat store");
        self.me = Some(me);
        self.status = StoreStatus::Initializing;
        self.load_cache();

        self.actions.push(StoreAction::Connect(ChannelKind::Chat));
        let count = self.fetch_unread_count();
        let conversations = self.fetch_conversations();
        self.init_ticket = Some(conversations);
        vec![count, conversations]
    }

    /// Disconnect and forget everything, including the cache entries.
    pub fn cleanup(&mut self) {
        tracing::info!("cleaning up chat store");
        self.tickets.clear();
        self.actions.clear();
        self.actions.push(StoreAction::Disconnect(ChannelKind::Chat));

        let mut keys = vec![CONVERSATIONS_KEY.to_string()];
        keys.extend(self.messages.keys().map(messages_key));
        keys.extend(self.conversations.iter().map(|c| messages_key(&c.id)));
        keys.sort();
        keys.dedup();
        for key in keys {
            if let Err(err) = self.cache.remove(&key) {
                tracing::warn!(%key, error = %err, "failed to clear cache entry");
            }
        }

        self.me = None;
        self.status = StoreStatus::Uninitialized;
        self.conversations.clear();
        self.messages.clear();
        self.seen.clear();
        self.pagination.clear();
        self.counters.clear();
        self.active = None;
        self.connected = false;
        self.loading = false;
        self.error = None;
        self.queued_receipts.clear();
        self.refreshing = None;
        self.init_ticket = None;
    }

    /// Fetch the conversation list.
    pub fn fetch_conversations(&mut self) -> Ticket {
        self.loading = true;
        let ticket = self.request(ApiRequest::Conversations, Op::Conversations);
        self.refreshing = Some(ticket);
        ticket
    }

    /// Fetch the authoritative unread total.
    pub fn fetch_unread_count(&mut self) -> Ticket {
        self.request(ApiRequest::ChatUnreadCount, Op::UnreadCount)
    }

    /// Fetch a page of messages. Page 0 without `append` replaces the loaded
    /// messages; other pages merge into them.
    ///
    /// # Errors
    ///
    /// - blank conversation id
    pub fn fetch_messages(
        &mut self,
        conversation_id: &ConversationId,
        page: u32,
        size: u32,
        append: bool,
    ) -> StoreResult<Ticket> {
        require_id(conversation_id.as_str(), "conversationId").map_err(|e| self.fail(e.into()))?;
        self.loading = true;
        let request =
            ApiRequest::Messages { conversation_id: conversation_id.clone(), page, size };
        Ok(self.request(request, Op::Messages {
            conversation_id: conversation_id.clone(),
            page,
            size,
            append,
        }))
    }

    /// Fetch the next (older) page of a conversation if there is one.
    pub fn fetch_more_messages(&mut self, conversation_id: &ConversationId) -> Option<Ticket> {
        let cursor = self.pagination(conversation_id);
        if !cursor.has_more {
            return None;
        }
        self.fetch_messages(conversation_id, cursor.current_page + 1, self.config.page_size, true)
            .ok()
    }

    /// Send a message: over the realtime channel when live, otherwise (or if
    /// that turns out to be unavailable) over REST.
    ///
    /// # Errors
    ///
    /// - `ValidationError` text for a missing recipient, blank or oversized
    ///   content, or a self-send; nothing is sent
    pub fn send_message(&mut self, message: OutgoingMessage) -> StoreResult<Ticket> {
        validate_outgoing(&message, self.me.as_ref()).map_err(|e| self.fail(e.into()))?;

        if self.connected {
            let ticket = self.tickets.issue(Op::SendRealtime(message.clone()));
            self.actions.push(StoreAction::Wire {
                ticket: Some(ticket),
                command: WireCommand::SendChat(message),
            });
            return Ok(ticket);
        }
        Ok(self.request(ApiRequest::SendMessage(message.clone()), Op::Send(message)))
    }

    /// Mark a whole conversation read: local zeroing now, REST persistence,
    /// realtime mirror.
    ///
    /// # Errors
    ///
    /// - blank conversation id
    pub fn mark_conversation_as_read(
        &mut self,
        conversation_id: &ConversationId,
    ) -> StoreResult<Ticket> {
        require_id(conversation_id.as_str(), "conversationId").map_err(|e| self.fail(e.into()))?;

        if self.mark_conversation_local_read(conversation_id) {
            self.broadcast(CrossTabMessage::ChatConversationRead {
                conversation_id: conversation_id.clone(),
            });
        }
        self.send_receipt(WireCommand::MarkConversationRead(conversation_id.clone()));
        Ok(self.request(
            ApiRequest::MarkConversationRead(conversation_id.clone()),
            Op::MarkConversationRead,
        ))
    }

    /// Mark one message read. Returns whether the message is loaded.
    ///
    /// The receipt goes over the realtime channel, queued until the next
    /// connect if it is down.
    ///
    /// # Errors
    ///
    /// - blank message id
    pub fn mark_message_as_read(&mut self, message_id: &MessageId) -> StoreResult<bool> {
        require_id(message_id.as_str(), "messageId").map_err(|e| self.fail(e.into()))?;

        let found = self.find_message(None, message_id);
        if let Some((conversation_id, flipped)) = self.mark_message_local_read(None, message_id) {
            if flipped {
                self.broadcast(CrossTabMessage::ChatMessageRead {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                });
            }
        }
        self.send_receipt(WireCommand::MarkMessageRead(message_id.clone()));
        Ok(found.is_some())
    }

    /// Open (or close) a conversation. Opening a visible conversation with
    /// unread messages marks it read.
    pub fn set_active_conversation(
        &mut self,
        conversation_id: Option<ConversationId>,
    ) -> Option<Ticket> {
        self.active = conversation_id;
        self.read_active_if_viewing()
    }

    /// Page visibility changed.
    pub fn set_visible(&mut self, visible: bool) -> Option<Ticket> {
        self.visible = visible;
        self.read_active_if_viewing()
    }

    /// Refresh over REST while the realtime channel is down: the unread
    /// total, and the first page of the open conversation. Does nothing
    /// when polling is not needed.
    pub fn poll(&mut self) -> Vec<Ticket> {
        if !self.needs_polling() {
            return Vec::new();
        }
        tracing::debug!(active = ?self.active, "polling chat over REST");
        let mut tickets = vec![self.fetch_unread_count()];
        if let Some(active) = self.active.clone() {
            tickets.extend(self.fetch_messages(&active, 0, self.config.page_size, false).ok());
        }
        tickets
    }

    /// Network reachability changed. Going offline records an error; coming
    /// back clears it and refreshes the unread total, plus the conversation
    /// list if none is loaded.
    pub fn set_online(&mut self, online: bool) -> Vec<Ticket> {
        self.online = online;
        if !online {
            self.fail(StoreError::new("No internet connection"));
            return Vec::new();
        }

        self.error = None;
        if self.me.is_none() {
            return Vec::new();
        }
        let mut tickets = vec![self.fetch_unread_count()];
        if self.conversations.is_empty() && self.refreshing.is_none() {
            tickets.push(self.fetch_conversations());
        }
        tickets
    }

    /// Set one conversation's unread count. The global total moves by the
    /// difference.
    pub fn set_conversation_unread(&mut self, conversation_id: &ConversationId, count: u32) {
        self.counters.set(conversation_id.clone(), count);
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == *conversation_id)
        {
            conversation.unread_count = count;
        }
    }

    /// Insert a message unless its id is already present in the
    /// conversation. Unread messages from other users bump the counters,
    /// unless the conversation is open and visible, in which case they are
    /// read on arrival. Returns whether it was inserted.
    pub fn add_incoming(&mut self, message: ChatMessage) -> bool {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let counts = self.is_from_other(&message) && !message.is_read;

        if self.seen.get(&conversation_id).is_some_and(|seen| seen.contains(&message_id)) {
            tracing::debug!(id = %message_id, "message already ingested");
            return false;
        }
        if !self.insert_message(message.clone()) {
            return false;
        }
        if !self.touch_conversation(&message) {
            self.refresh_conversations();
        }

        if counts {
            if self.is_viewing(&conversation_id) {
                self.mark_message_local_read(Some(&conversation_id), &message_id);
                self.send_receipt(WireCommand::MarkMessageRead(message_id));
            } else {
                let next = self.counters.get(&conversation_id).saturating_add(1);
                self.set_conversation_unread(&conversation_id, next);
            }
        }
        true
    }

    /// Apply an event from the channel.
    pub fn on_realtime(&mut self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::ChatMessage(message) => {
                if self.add_incoming(message.clone()) {
                    self.broadcast(CrossTabMessage::ChatNewMessage { message: message.clone() });
                    self.persist_messages(&message.conversation_id);
                    self.persist_conversations();
                }
            },
            RealtimeEvent::ReadStatusUpdate(update) if update.is_read => {
                if let Some((conversation_id, true)) =
                    self.mark_message_local_read(update.conversation_id.as_ref(), &update.message_id)
                {
                    self.persist_messages(&conversation_id);
                }
            },
            RealtimeEvent::MessageRead { message_id, conversation_id } => {
                if let Some((conversation_id, true)) =
                    self.mark_message_local_read(conversation_id.as_ref(), message_id)
                {
                    self.persist_messages(&conversation_id);
                }
            },
            RealtimeEvent::ConversationRead { conversation_id } => {
                self.mark_conversation_local_read(conversation_id);
            },
            RealtimeEvent::UnreadCountUpdate(update) => {
                if let (Some(id), Some(count)) =
                    (&update.conversation_id, update.conversation_unread_count)
                {
                    self.set_conversation_unread(id, count);
                }
                if self.counters.set_total(update.total_unread_count) {
                    self.refresh_conversations();
                }
            },
            RealtimeEvent::Reconnection(ReconnectionStatus::Succeeded { attempts }) => {
                tracing::info!(attempts, "resyncing chat after reconnection");
                self.sync_after_reconnection();
            },
            RealtimeEvent::ConnectionChange { channel: ChannelKind::Chat, connected } => {
                self.connected = *connected;
                if *connected {
                    self.flush_receipts();
                }
                self.broadcast(CrossTabMessage::Connection {
                    channel: ChannelKind::Chat,
                    connected: *connected,
                });
            },
            _ => {},
        }
    }

    /// Apply a mutation made in another tab. Never rebroadcasts; an unknown
    /// conversation only triggers a conversation refresh.
    pub fn apply_remote(&mut self, message: &CrossTabMessage) {
        match message {
            CrossTabMessage::ChatNewMessage { message } => {
                if self.add_incoming(message.clone()) {
                    self.persist_messages(&message.conversation_id);
                }
            },
            CrossTabMessage::ChatMessageRead { conversation_id, message_id } => {
                self.mark_message_local_read(Some(conversation_id), message_id);
                self.actions.push(StoreAction::Publish(RealtimeEvent::CrossTabMessageRead {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                }));
            },
            CrossTabMessage::ChatConversationRead { conversation_id } => {
                self.mark_conversation_local_read(conversation_id);
            },
            CrossTabMessage::Connection { channel: ChannelKind::Chat, connected } => {
                tracing::debug!(connected, "chat connection changed in another tab");
            },
            _ => {},
        }
    }

    /// Outcome of a ticketed realtime send. A `NotConnected` failure
    /// re-issues the send over REST under the same ticket and returns `None`.
    pub fn wire_result(
        &mut self,
        ticket: Ticket,
        result: Result<(), ChannelError>,
    ) -> Option<Completed> {
        let Some(op) = self.tickets.take(ticket) else {
            tracing::debug!(%ticket, "ignoring wire result for unknown ticket");
            return None;
        };

        match (op, result) {
            (Op::SendRealtime(_), Ok(())) => Some(Completed { ticket, result: Ok(Outcome::Sent(None)) }),
            (Op::SendRealtime(message), Err(ChannelError::NotConnected)) => {
                tracing::debug!(%ticket, "realtime send unavailable, using REST");
                self.tickets.reissue(ticket, Op::Send(message.clone()));
                self.actions.push(StoreAction::Request {
                    ticket,
                    request: ApiRequest::SendMessage(message),
                    policy: self.config.retry,
                });
                None
            },
            (Op::SendRealtime(_), Err(err)) => {
                Some(Completed { ticket, result: Err(self.fail(err.into())) })
            },
            (op, _) => {
                self.tickets.reissue(ticket, op);
                None
            },
        }
    }

    /// Finish a ticketed request. Returns `None` for unknown tickets.
    pub fn complete(
        &mut self,
        ticket: Ticket,
        result: Result<ApiResponse, ApiError>,
        now: DateTime<Utc>,
    ) -> Option<Completed> {
        let Some(op) = self.tickets.take(ticket) else {
            tracing::debug!(%ticket, "ignoring completion for unknown ticket");
            return None;
        };

        let result = match op {
            Op::UnreadCount => result.and_then(|r| r.count()).map(|count| {
                if self.counters.set_total(count) {
                    self.refresh_conversations();
                }
                Outcome::Count(count)
            }),
            Op::Conversations => {
                if self.refreshing == Some(ticket) {
                    self.refreshing = None;
                }
                self.loading = false;
                let me = self.me.clone().unwrap_or_else(|| UserId::new(""));
                match result.and_then(|r| r.conversations(&me, now)) {
                    Err(err) if err.is_not_found() => Ok(Vec::new()),
                    other => other,
                }
                .map(|conversations| {
                    self.apply_conversations(conversations);
                    Outcome::Conversations(self.conversations.clone())
                })
            },
            Op::Messages { conversation_id, page, size, append } => {
                self.loading = false;
                match result.and_then(|r| r.messages(page, size, now)) {
                    Err(err) if err.is_not_found() => {
                        Ok(Page { items: vec![], page, total_pages: Some(0), has_more: false })
                    },
                    other => other,
                }
                .map(|page| {
                    self.apply_messages(&conversation_id, &page, append);
                    Outcome::Messages(page)
                })
            },
            Op::Send(_) => result.map(|response| {
                let sent = response.sent_message(now);
                if let Some(message) = &sent {
                    self.record_sent(message.clone());
                }
                Outcome::Sent(sent)
            }),
            Op::SendRealtime(message) => {
                self.tickets.reissue(ticket, Op::SendRealtime(message));
                return None;
            },
            Op::MarkConversationRead => result.map(|_| Outcome::Done),
        };

        if self.init_ticket == Some(ticket) {
            self.init_ticket = None;
            self.status = StoreStatus::Ready;
        }

        let result = result.map_err(|err| self.fail(err.into()));
        Some(Completed { ticket, result })
    }

    fn record_sent(&mut self, message: ChatMessage) {
        let conversation_id = message.conversation_id.clone();
        if !self.insert_message(message.clone()) {
            return;
        }
        if !self.touch_conversation(&message) {
            self.refresh_conversations();
        }
        self.broadcast(CrossTabMessage::ChatNewMessage { message });
        self.persist_messages(&conversation_id);
        self.persist_conversations();
    }

    fn apply_conversations(&mut self, mut conversations: Vec<Conversation>) {
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.counters.replace(conversations.iter().map(|c| (c.id.clone(), c.unread_count)));
        self.conversations = conversations;
        self.persist_conversations();
    }

    fn apply_messages(&mut self, conversation_id: &ConversationId, page: &Page<ChatMessage>, append: bool) {
        if !append {
            self.messages.remove(conversation_id);
        }
        for message in &page.items {
            if message.conversation_id == *conversation_id {
                self.insert_message(message.clone());
            }
        }
        self.pagination.insert(conversation_id.clone(), page.into());
        self.persist_messages(conversation_id);
    }

    fn sync_after_reconnection(&mut self) {
        self.fetch_unread_count();
        self.refresh_conversations();
        if let Some(active) = self.active.clone() {
            // Errors only on a blank id, which `active` never holds.
            let _ = self.fetch_messages(&active, 0, self.config.page_size, false);
        }
    }

    fn refresh_conversations(&mut self) {
        if self.refreshing.is_none() {
            self.fetch_conversations();
        }
    }

    fn read_active_if_viewing(&mut self) -> Option<Ticket> {
        let active = self.active.clone().filter(|_| self.visible)?;
        if self.counters.get(&active) == 0 {
            return None;
        }
        self.mark_conversation_as_read(&active).ok()
    }

    fn is_viewing(&self, conversation_id: &ConversationId) -> bool {
        self.visible && self.active.as_ref() == Some(conversation_id)
    }

    fn is_from_other(&self, message: &ChatMessage) -> bool {
        self.me.as_ref().is_none_or(|me| *me != message.sender_id)
    }

    /// Insert in chronological order, dropping duplicates and evicting the
    /// oldest beyond the per-conversation cap. Returns whether the message
    /// is kept; one older than every kept message of a full list is not.
    fn insert_message(&mut self, message: ChatMessage) -> bool {
        let max = self.config.max_messages;
        let remembered = self.config.seen_messages.max(max);
        self.seen
            .entry(message.conversation_id.clone())
            .or_insert_with(|| SeenIds::new(remembered))
            .insert(message.id.clone());

        let list = self.messages.entry(message.conversation_id.clone()).or_default();
        if list.iter().any(|m| m.id == message.id) {
            tracing::debug!(id = %message.id, "duplicate message");
            return false;
        }

        let id = message.id.clone();
        let pos = list.partition_point(|m| m.created_at <= message.created_at);
        list.insert(pos, message);
        if list.len() > max {
            let excess = list.len() - max;
            if list.drain(..excess).any(|evicted| evicted.id == id) {
                tracing::debug!(%id, "message older than every kept message");
                return false;
            }
        }
        true
    }

    /// Point the conversation at `message` if it is the newest. Returns
    /// `false` if the conversation is not loaded.
    fn touch_conversation(&mut self, message: &ChatMessage) -> bool {
        let Some(conversation) =
            self.conversations.iter_mut().find(|c| c.id == message.conversation_id)
        else {
            return false;
        };

        let newer = conversation
            .latest_message
            .as_ref()
            .is_none_or(|latest| latest.created_at <= message.created_at);
        if newer {
            conversation.latest_message = Some(message.clone());
            conversation.updated_at = conversation.updated_at.max(message.created_at);
            self.conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
        true
    }

    fn find_message(
        &self,
        conversation_id: Option<&ConversationId>,
        message_id: &MessageId,
    ) -> Option<(ConversationId, usize)> {
        let search = |id: &ConversationId, list: &Vec<ChatMessage>| {
            list.iter().position(|m| m.id == *message_id).map(|pos| (id.clone(), pos))
        };
        match conversation_id {
            Some(id) => self.messages.get(id).and_then(|list| search(id, list)),
            None => self.messages.iter().find_map(|(id, list)| search(id, list)),
        }
    }

    /// Flip a message to read. Returns its conversation and whether it was
    /// unread before; an unread message from another user also decrements
    /// the conversation's count.
    fn mark_message_local_read(
        &mut self,
        conversation_id: Option<&ConversationId>,
        message_id: &MessageId,
    ) -> Option<(ConversationId, bool)> {
        let (conversation_id, pos) = self.find_message(conversation_id, message_id)?;
        let message = self.messages.get(&conversation_id)?.get(pos)?.clone();
        if message.is_read {
            return Some((conversation_id, false));
        }

        if let Some(stored) = self.messages.get_mut(&conversation_id).and_then(|l| l.get_mut(pos)) {
            stored.is_read = true;
        }
        if self.is_from_other(&message) {
            let next = self.counters.get(&conversation_id).saturating_sub(1);
            self.set_conversation_unread(&conversation_id, next);
        }
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == conversation_id)
        {
            if let Some(latest) = conversation.latest_message.as_mut().filter(|l| l.id == *message_id)
            {
                latest.is_read = true;
            }
        }
        Some((conversation_id, true))
    }

    /// Mark every message of a conversation read and zero its count. Returns
    /// whether anything changed.
    fn mark_conversation_local_read(&mut self, conversation_id: &ConversationId) -> bool {
        let me = self.me.clone();
        let mut changed = false;
        if let Some(list) = self.messages.get_mut(conversation_id) {
            for message in list.iter_mut() {
                let from_other = me.as_ref().is_none_or(|me| *me != message.sender_id);
                if from_other && !message.is_read {
                    message.is_read = true;
                    changed = true;
                }
            }
        }
        if self.counters.get(conversation_id) > 0 {
            changed = true;
        }
        self.set_conversation_unread(conversation_id, 0);

        if changed {
            self.persist_messages(conversation_id);
            self.persist_conversations();
        }
        changed
    }

    fn send_receipt(&mut self, command: WireCommand) {
        if self.connected {
            self.actions.push(StoreAction::Wire { ticket: None, command });
        } else if !self.queued_receipts.contains(&command) {
            tracing::debug!(?command, "queueing read receipt until reconnect");
            self.queued_receipts.push(command);
        }
    }

    fn flush_receipts(&mut self) {
        for command in std::mem::take(&mut self.queued_receipts) {
            self.actions.push(StoreAction::Wire { ticket: None, command });
        }
    }

    fn request(&mut self, request: ApiRequest, op: Op) -> Ticket {
        let ticket = self.tickets.issue(op);
        self.actions.push(StoreAction::Request { ticket, request, policy: self.config.retry });
        ticket
    }

    fn broadcast(&mut self, message: CrossTabMessage) {
        self.actions.push(StoreAction::Broadcast(message));
    }

    fn fail(&mut self, err: StoreError) -> StoreError {
        tracing::warn!(error = %err.message, "chat store operation failed");
        self.error = Some(err.clone());
        err
    }

    fn load_cache(&mut self) {
        if !self.conversations.is_empty() {
            return;
        }
        let conversations: Vec<Conversation> = match self.cache.get_json(CONVERSATIONS_KEY) {
            Ok(Some(conversations)) => conversations,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read conversation cache");
                return;
            },
        };

        for conversation in &conversations {
            match self.cache.get_json::<Vec<ChatMessage>>(&messages_key(&conversation.id)) {
                Ok(Some(messages)) => {
                    for message in messages {
                        self.insert_message(message);
                    }
                },
                Ok(None) => {},
                Err(err) => tracing::warn!(error = %err, "failed to read message cache"),
            }
        }
        tracing::debug!(count = conversations.len(), "loaded cached conversations");
        self.apply_conversations(conversations);
    }

    fn persist_conversations(&self) {
        let snapshot: Vec<_> =
            self.conversations.iter().take(self.config.persisted_conversations).collect();
        if let Err(err) = self.cache.set_json(CONVERSATIONS_KEY, &snapshot) {
            tracing::warn!(error = %err, "failed to persist conversations");
        }
    }

    fn persist_messages(&self, conversation_id: &ConversationId) {
        let messages = self.messages(conversation_id);
        let start = messages.len().saturating_sub(self.config.persisted_messages);
        if let Err(err) = self.cache.set_json(&messages_key(conversation_id), &messages[start..]) {
            tracing::warn!(error = %err, "failed to persist messages");
        }
    }
}
