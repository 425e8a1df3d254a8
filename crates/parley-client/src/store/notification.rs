//! Notification store.

use chrono::{DateTime, Utc};
use parley_core::{RetryPolicy, TabCache, cache::NOTIFICATIONS_KEY};
use parley_proto::{
    Notification, NotificationId, NotificationPreference, payload::preference_from_value,
};
use serde::{Deserialize, Serialize};

use super::{
    Completed, Outcome, Pagination, SeenIds, StoreAction, StoreStatus, Ticket, TicketBook,
};
use crate::{
    api::{ApiRequest, ApiResponse, Page},
    channel::{ChannelKind, WireCommand},
    cross_tab::{CONNECTION_STATUS_MAX_AGE_SECS, CrossTabMessage},
    error::{ApiError, StoreError, StoreResult, ValidationError},
    event::RealtimeEvent,
};

/// Notification store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationStoreConfig {
    /// Notifications kept in memory; the oldest are evicted.
    pub max_items: usize,
    /// Notifications written to the cache.
    pub persisted_items: usize,
    /// Default page size.
    pub page_size: u32,
    /// Notification ids remembered after eviction, so a late redelivery is
    /// still recognised.
    pub seen_items: usize,
    /// REST retry policy.
    pub retry: RetryPolicy,
}

impl Default for NotificationStoreConfig {
    fn default() -> Self {
        Self {
            max_items: 100,
            persisted_items: 20,
            page_size: 20,
            seen_items: 1000,
            retry: RetryPolicy::service(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    notifications: Vec<Notification>,
    unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionStatus {
    connected: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
enum Op {
    UnreadCount,
    Page { page: u32, size: u32, append: bool },
    MarkRead,
    MarkAllRead,
    Preferences,
    UpdatePreference { kind: String, email_enabled: bool, web_push_enabled: bool },
}

fn connection_key() -> String {
    format!("{NOTIFICATIONS_KEY}.connection")
}

fn preferences_key() -> String {
    format!("{NOTIFICATIONS_KEY}.preferences")
}

/// Canonical notification state for one tab.
#[derive(Debug)]
pub struct NotificationStore {
    config: NotificationStoreConfig,
    cache: TabCache,
    status: StoreStatus,
    notifications: Vec<Notification>,
    seen: SeenIds<NotificationId>,
    unread_count: u32,
    pagination: Pagination,
    preferences: Vec<NotificationPreference>,
    connected: bool,
    loading: bool,
    error: Option<StoreError>,
    init_ticket: Option<Ticket>,
    tickets: TicketBook<Op>,
    actions: Vec<StoreAction>,
}

impl NotificationStore {
    /// Empty store persisting through `cache`.
    pub fn new(config: NotificationStoreConfig, cache: TabCache) -> Self {
        Self {
            config,
            cache,
            status: StoreStatus::Uninitialized,
            notifications: Vec::new(),
            seen: SeenIds::new(config.seen_items.max(config.max_items)),
            unread_count: 0,
            pagination: Pagination::default(),
            preferences: Vec::new(),
            connected: false,
            loading: false,
            error: None,
            init_ticket: None,
            tickets: TicketBook::default(),
            actions: Vec::new(),
        }
    }

    /// Tuning this store was built with.
    pub fn config(&self) -> &NotificationStoreConfig {
        &self.config
    }

    /// Notifications, newest first.
    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Unread counter.
    pub fn unread_count(&self) -> u32 {
        self.unread_count
    }

    /// Unread notifications among those loaded.
    pub fn unread(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter().filter(|n| !n.read)
    }

    /// Pagination cursor.
    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    /// Delivery preferences.
    pub fn preferences(&self) -> &[NotificationPreference] {
        &self.preferences
    }

    /// Whether the realtime channel is live.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a page fetch is in flight.
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

    /// Outstanding tickets.
    pub fn pending_requests(&self) -> usize {
        self.tickets.len()
    }

    /// Drain queued actions.
    pub fn take_actions(&mut self) -> Vec<StoreAction> {
        std::mem::take(&mut self.actions)
    }

    /// Load the cache, connect the channel and fetch the unread count, the
    /// first page and preferences. Safe to call again.
    pub fn initialize(&mut self, now: DateTime<Utc>) -> Vec<Ticket> {
        tracing::info!(status = ?self.status, "initializing notification store");
        self.status = StoreStatus::Initializing;
        self.load_cache(now);

        self.actions.push(StoreAction::Connect(ChannelKind::Notification));
        let count = self.fetch_unread_count();
        let page = self.fetch_notifications(0, self.config.page_size, false, false);
        let preferences = self.fetch_preferences();
        self.init_ticket = Some(page);
        vec![count, page, preferences]
    }

    /// Disconnect and forget everything, including the cache entries.
    pub fn cleanup(&mut self) {
        tracing::info!("cleaning up notification store");
        self.tickets.clear();
        self.actions.clear();
        self.actions.push(StoreAction::Disconnect(ChannelKind::Notification));

        self.status = StoreStatus::Uninitialized;
        self.notifications.clear();
        self.seen.clear();
        self.unread_count = 0;
        self.pagination = Pagination::default();
        self.preferences.clear();
        self.connected = false;
        self.loading = false;
        self.error = None;
        self.init_ticket = None;

        for key in [NOTIFICATIONS_KEY.to_string(), connection_key(), preferences_key()] {
            if let Err(err) = self.cache.remove(&key) {
                tracing::warn!(%key, error = %err, "failed to clear cache entry");
            }
        }
    }

    /// Fetch a page. `append` adds it after the loaded items instead of
    /// replacing them.
    pub fn fetch_notifications(
        &mut self,
        page: u32,
        size: u32,
        append: bool,
        unread_only: bool,
    ) -> Ticket {
        self.loading = true;
        self.error = None;
        self.request(ApiRequest::Notifications { page, size, unread_only }, Op::Page {
            page,
            size,
            append,
        })
    }

    /// Fetch the next page if there is one.
    pub fn fetch_more(&mut self) -> Option<Ticket> {
        if !self.pagination.has_more || self.loading {
            return None;
        }
        let next = self.pagination.current_page + 1;
        Some(self.fetch_notifications(next, self.config.page_size, true, false))
    }

    /// Fetch the authoritative unread counter.
    pub fn fetch_unread_count(&mut self) -> Ticket {
        self.request(ApiRequest::NotificationUnreadCount, Op::UnreadCount)
    }

    /// Mark one notification read.
    ///
    /// The local flip happens now and is never rolled back. The read is
    /// persisted over REST and mirrored over the realtime channel.
    ///
    /// # Errors
    ///
    /// - blank id
    pub fn mark_as_read(&mut self, id: &NotificationId) -> StoreResult<Ticket> {
        if id.is_blank() {
            return Err(self.fail(ValidationError::MissingId { field: "notificationId" }.into()));
        }

        if self.mark_local_read(id) {
            self.broadcast(CrossTabMessage::NotificationRead { notification_id: id.clone() });
            self.persist();
        }
        self.actions.push(StoreAction::Wire {
            ticket: None,
            command: WireCommand::MarkNotificationRead(id.clone()),
        });
        Ok(self.request(ApiRequest::MarkNotificationRead(id.clone()), Op::MarkRead))
    }

    /// Mark every notification read.
    pub fn mark_all_as_read(&mut self) -> Ticket {
        self.mark_all_local_read();
        self.broadcast(CrossTabMessage::NotificationsAllRead);
        self.persist();
        self.request(ApiRequest::MarkAllNotificationsRead, Op::MarkAllRead)
    }

    /// Drop a notification locally. Returns whether it was present.
    pub fn remove_notification(&mut self, id: &NotificationId) -> bool {
        let Some(pos) = self.notifications.iter().position(|n| n.id == *id) else {
            return false;
        };
        let removed = self.notifications.remove(pos);
        if !removed.read {
            self.unread_count = self.unread_count.saturating_sub(1);
        }
        self.persist();
        true
    }

    /// Fetch delivery preferences. On failure the cached copy is used.
    pub fn fetch_preferences(&mut self) -> Ticket {
        self.request(ApiRequest::NotificationPreferences, Op::Preferences)
    }

    /// Change one category's delivery preference.
    ///
    /// # Errors
    ///
    /// - blank category
    pub fn update_preference(
        &mut self,
        kind: &str,
        email_enabled: bool,
        web_push_enabled: bool,
    ) -> StoreResult<Ticket> {
        if kind.trim().is_empty() {
            return Err(self.fail(ValidationError::MissingId { field: "type" }.into()));
        }
        let request = ApiRequest::UpdatePreference {
            kind: kind.to_string(),
            email_enabled,
            web_push_enabled,
        };
        Ok(self.request(request, Op::UpdatePreference {
            kind: kind.to_string(),
            email_enabled,
            web_push_enabled,
        }))
    }

    /// Insert a notification unless its id was already ingested, even if it
    /// has since been evicted. Returns whether it was inserted.
    pub fn add_incoming(&mut self, notification: Notification) -> bool {
        if !self.seen.insert(notification.id.clone())
            || self.notifications.iter().any(|n| n.id == notification.id)
        {
            tracing::debug!(id = %notification.id, "duplicate notification");
            return false;
        }
        if !notification.read {
            self.unread_count = self.unread_count.saturating_add(1);
        }
        self.notifications.insert(0, notification);
        self.notifications.truncate(self.config.max_items);
        true
    }

    /// Apply an event from the channel.
    pub fn on_realtime(&mut self, event: &RealtimeEvent, now: DateTime<Utc>) {
        match event {
            RealtimeEvent::NewNotification(notification) => {
                if self.add_incoming(notification.clone()) {
                    self.broadcast(CrossTabMessage::NotificationNew {
                        notification: notification.clone(),
                    });
                    self.persist();
                }
            },
            RealtimeEvent::NotificationRead { notification_id } => {
                if self.mark_local_read(notification_id) {
                    self.broadcast(CrossTabMessage::NotificationRead {
                        notification_id: notification_id.clone(),
                    });
                    self.persist();
                }
            },
            RealtimeEvent::ConnectionChange { channel: ChannelKind::Notification, connected } => {
                self.connected = *connected;
                self.persist_connection(now);
                self.broadcast(CrossTabMessage::Connection {
                    channel: ChannelKind::Notification,
                    connected: *connected,
                });
            },
            _ => {},
        }
    }

    /// Apply a mutation made in another tab. Never issues REST calls or
    /// rebroadcasts.
    pub fn apply_remote(&mut self, message: &CrossTabMessage) {
        let changed = match message {
            CrossTabMessage::NotificationNew { notification } => {
                self.add_incoming(notification.clone())
            },
            CrossTabMessage::NotificationRead { notification_id } => {
                self.mark_local_read(notification_id)
            },
            CrossTabMessage::NotificationsAllRead => {
                self.mark_all_local_read();
                true
            },
            CrossTabMessage::Connection { channel: ChannelKind::Notification, connected } => {
                tracing::debug!(connected, "notification connection changed in another tab");
                false
            },
            _ => false,
        };
        if changed {
            self.persist();
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
                self.unread_count = count;
                self.persist();
                Outcome::Count(count)
            }),
            Op::Page { page, size, append } => {
                self.loading = false;
                let page = match result.and_then(|r| r.notifications(page, size, now)) {
                    Err(err) if err.is_not_found() => Ok(Page {
                        items: vec![],
                        page,
                        total_pages: Some(0),
                        has_more: false,
                    }),
                    other => other,
                };
                page.map(|page| {
                    self.apply_page(&page, append);
                    Outcome::Notifications(page)
                })
            },
            Op::MarkRead | Op::MarkAllRead => result.map(|_| Outcome::Done),
            Op::Preferences => match result.and_then(|r| r.preferences()) {
                Ok(preferences) => {
                    self.preferences = preferences;
                    self.persist_preferences();
                    Ok(Outcome::Preferences(self.preferences.clone()))
                },
                Err(err) => {
                    if let Ok(Some(cached)) = self.cache.get_json(&preferences_key()) {
                        tracing::warn!(error = %err, "using cached preferences");
                        self.preferences = cached;
                    }
                    Err(err)
                },
            },
            Op::UpdatePreference { kind, email_enabled, web_push_enabled } => result.map(|r| {
                let updated = preference_from_value(r.data).unwrap_or_else(|_| {
                    NotificationPreference {
                        display_name: self
                            .preferences
                            .iter()
                            .find(|p| p.kind == kind)
                            .map(|p| p.display_name.clone())
                            .unwrap_or_default(),
                        kind: kind.clone(),
                        email_enabled,
                        web_push_enabled,
                    }
                });
                match self.preferences.iter_mut().find(|p| p.kind == updated.kind) {
                    Some(existing) => *existing = updated,
                    None => self.preferences.push(updated),
                }
                self.persist_preferences();
                Outcome::Preferences(self.preferences.clone())
            }),
        };

        if self.init_ticket == Some(ticket) {
            self.init_ticket = None;
            self.status = StoreStatus::Ready;
        }

        let result = result.map_err(|err| self.fail(err.into()));
        Some(Completed { ticket, result })
    }

    fn apply_page(&mut self, page: &Page<Notification>, append: bool) {
        for notification in &page.items {
            self.seen.insert(notification.id.clone());
        }
        if append {
            for notification in &page.items {
                if !self.notifications.iter().any(|n| n.id == notification.id) {
                    self.notifications.push(notification.clone());
                }
            }
        } else {
            self.notifications = page.items.clone();
        }
        self.notifications.truncate(self.config.max_items);
        self.pagination = page.into();
        self.persist();
    }

    fn mark_local_read(&mut self, id: &NotificationId) -> bool {
        match self.notifications.iter_mut().find(|n| n.id == *id) {
            Some(notification) if !notification.read => {
                notification.read = true;
                self.unread_count = self.unread_count.saturating_sub(1);
                true
            },
            _ => false,
        }
    }

    fn mark_all_local_read(&mut self) {
        for notification in &mut self.notifications {
            notification.read = true;
        }
        self.unread_count = 0;
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
        tracing::warn!(error = %err.message, "notification store operation failed");
        self.error = Some(err.clone());
        err
    }

    fn load_cache(&mut self, now: DateTime<Utc>) {
        match self.cache.get_json::<Snapshot>(NOTIFICATIONS_KEY) {
            Ok(Some(snapshot)) if self.notifications.is_empty() => {
                tracing::debug!(count = snapshot.notifications.len(), "loaded cached notifications");
                self.notifications = snapshot.notifications;
                for notification in &self.notifications {
                    self.seen.insert(notification.id.clone());
                }
                self.unread_count = snapshot.unread_count;
            },
            Ok(_) => {},
            Err(err) => tracing::warn!(error = %err, "failed to read notification cache"),
        }

        if let Ok(Some(status)) = self.cache.get_json::<ConnectionStatus>(&connection_key()) {
            let age = now.signed_duration_since(status.timestamp).num_seconds();
            if age <= CONNECTION_STATUS_MAX_AGE_SECS {
                self.connected = status.connected;
            }
        }

        if self.preferences.is_empty() {
            if let Ok(Some(cached)) = self.cache.get_json(&preferences_key()) {
                self.preferences = cached;
            }
        }
    }

    fn persist(&self) {
        let snapshot = Snapshot {
            notifications: self
                .notifications
                .iter()
                .take(self.config.persisted_items)
                .cloned()
                .collect(),
            unread_count: self.unread_count,
        };
        if let Err(err) = self.cache.set_json(NOTIFICATIONS_KEY, &snapshot) {
            tracing::warn!(error = %err, "failed to persist notifications");
        }
    }

    fn persist_preferences(&self) {
        if let Err(err) = self.cache.set_json(&preferences_key(), &self.preferences) {
            tracing::warn!(error = %err, "failed to cache preferences");
        }
    }

    fn persist_connection(&self, now: DateTime<Utc>) {
        let status = ConnectionStatus { connected: self.connected, timestamp: now };
        if let Err(err) = self.cache.set_json(&connection_key(), &status) {
            tracing::warn!(error = %err, "failed to persist connection status");
        }
    }
}
