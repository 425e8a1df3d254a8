//! Clone-able command surface for a running [`Runtime`](crate::Runtime).

use parley_client::{ChannelError, EventBus, Outcome, RealtimeEvent, StoreError, StoreResult};
use parley_proto::{ChatMessage, ConversationId, MessageId, NotificationId, OutgoingMessage};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    RuntimeError,
    command::{ChatOp, ChatSnapshot, Command, NotificationOp, NotificationSnapshot},
};

/// Talks to the runtime task. Every method waits for the runtime's answer;
/// ticketed operations resolve when their REST call (with retries) has
/// finished.
#[derive(Debug, Clone)]
pub struct ParleyHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus<RealtimeEvent>,
}

impl ParleyHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, bus: EventBus<RealtimeEvent>) -> Self {
        Self { commands, bus }
    }

    /// Realtime and cross-tab events, as views see them.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.bus.subscribe()
    }

    /// Initialize both stores for the current session and connect.
    pub async fn start(&self) -> StoreResult<()> {
        self.ask(Command::Start).await?
    }

    /// Clean up both stores and disconnect.
    pub async fn logout(&self) -> StoreResult<()> {
        Ok(self.ask(Command::Logout).await?)
    }

    /// Stop the runtime task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Retry the realtime connection now, resetting the attempt budget.
    pub async fn manual_reconnect(&self) -> StoreResult<()> {
        self.ask(Command::ManualReconnect)
            .await?
            .map_err(|err| StoreError::from(ChannelError::from(err)))
    }

    /// Load a notification page.
    pub async fn fetch_notifications(
        &self,
        page: u32,
        size: u32,
        append: bool,
        unread_only: bool,
    ) -> StoreResult<Outcome> {
        self.notification(NotificationOp::Fetch { page, size, append, unread_only }).await
    }

    /// Load the next notification page; `Outcome::Done` if there is none.
    pub async fn fetch_more_notifications(&self) -> StoreResult<Outcome> {
        self.notification(NotificationOp::FetchMore).await
    }

    /// Refresh the notification unread counter.
    pub async fn fetch_notification_unread_count(&self) -> StoreResult<Outcome> {
        self.notification(NotificationOp::UnreadCount).await
    }

    /// Mark one notification read.
    pub async fn mark_notification_read(&self, id: NotificationId) -> StoreResult<Outcome> {
        self.notification(NotificationOp::MarkRead(id)).await
    }

    /// Mark every notification read.
    pub async fn mark_all_notifications_read(&self) -> StoreResult<Outcome> {
        self.notification(NotificationOp::MarkAllRead).await
    }

    /// Drop a notification locally. Returns whether it was present.
    pub async fn remove_notification(&self, id: NotificationId) -> StoreResult<bool> {
        Ok(self.ask(|reply| Command::RemoveNotification(id, reply)).await?)
    }

    /// Load delivery preferences.
    pub async fn fetch_preferences(&self) -> StoreResult<Outcome> {
        self.notification(NotificationOp::Preferences).await
    }

    /// Change one category's delivery preference.
    pub async fn update_preference(
        &self,
        kind: impl Into<String>,
        email_enabled: bool,
        web_push_enabled: bool,
    ) -> StoreResult<Outcome> {
        self.notification(NotificationOp::UpdatePreference {
            kind: kind.into(),
            email_enabled,
            web_push_enabled,
        })
        .await
    }

    /// Load the conversation list.
    pub async fn fetch_conversations(&self) -> StoreResult<Outcome> {
        self.chat(ChatOp::Conversations).await
    }

    /// Refresh the chat unread total.
    pub async fn fetch_chat_unread_count(&self) -> StoreResult<Outcome> {
        self.chat(ChatOp::UnreadCount).await
    }

    /// Load a message page.
    pub async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        size: u32,
        append: bool,
    ) -> StoreResult<Outcome> {
        self.chat(ChatOp::Messages { conversation_id, page, size, append }).await
    }

    /// Load older messages; `Outcome::Done` if there are none.
    pub async fn fetch_more_messages(&self, conversation_id: ConversationId) -> StoreResult<Outcome> {
        self.chat(ChatOp::MoreMessages(conversation_id)).await
    }

    /// Send a chat message.
    pub async fn send_message(&self, message: OutgoingMessage) -> StoreResult<Outcome> {
        self.chat(ChatOp::Send(message)).await
    }

    /// Mark a conversation read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Outcome> {
        self.chat(ChatOp::MarkConversationRead(conversation_id)).await
    }

    /// Mark one message read. Returns whether it is loaded.
    pub async fn mark_message_read(&self, id: MessageId) -> StoreResult<bool> {
        self.ask(|reply| Command::MarkMessageRead(id, reply)).await?
    }

    /// Open or close a conversation.
    pub async fn set_active_conversation(
        &self,
        conversation_id: Option<ConversationId>,
    ) -> StoreResult<()> {
        self.tell(Command::SetActiveConversation(conversation_id)).await
    }

    /// Report page visibility.
    pub async fn set_visible(&self, visible: bool) -> StoreResult<()> {
        self.tell(Command::SetVisible(visible)).await
    }

    /// Report network reachability. Going offline records an error on the
    /// chat store; coming back reconnects and refreshes counters.
    pub async fn set_online(&self, online: bool) -> StoreResult<()> {
        self.tell(Command::SetOnline(online)).await
    }

    /// Copy of the notification state.
    pub async fn notification_snapshot(&self) -> StoreResult<NotificationSnapshot> {
        Ok(self.ask(Command::NotificationSnapshot).await?)
    }

    /// Copy of the chat state.
    pub async fn chat_snapshot(&self) -> StoreResult<ChatSnapshot> {
        Ok(self.ask(Command::ChatSnapshot).await?)
    }

    /// Loaded messages of one conversation, oldest first.
    pub async fn messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<ChatMessage>> {
        Ok(self.ask(|reply| Command::Messages(conversation_id, reply)).await?)
    }

    async fn notification(&self, op: NotificationOp) -> StoreResult<Outcome> {
        self.ask(|reply| Command::Notification(op, reply)).await?
    }

    async fn chat(&self, op: ChatOp) -> StoreResult<Outcome> {
        self.ask(|reply| Command::Chat(op, reply)).await?
    }

    async fn tell(&self, command: Command) -> StoreResult<()> {
        self.commands.send(command).await.map_err(|_| RuntimeError::Stopped)?;
        Ok(())
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| RuntimeError::Stopped)?;
        answer.await.map_err(|_| RuntimeError::SessionEnded)
    }
}
