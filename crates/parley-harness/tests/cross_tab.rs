//! Two tabs sharing one cache
//!
//! Each tab owns its stores and a `CrossTabSync`. Broadcast actions are
//! written to the shared cache and replayed in the other tab, the way the
//! runtime does it.

use std::time::Duration;

use parley_client::{
    ChannelKind, ChatStore, ChatStoreConfig, CrossTabMessage, CrossTabSync, NotificationStore,
    NotificationStoreConfig, RealtimeEvent, StoreAction,
};
use parley_core::{Environment, SharedCache, TabId, cache::CacheSubscription};
use parley_harness::{
    InvariantRegistry, ReadFlagsConverge, SimEnv, SimInstant, SystemSnapshot, TabSnapshot, fixtures,
};

struct Tab {
    id: u64,
    notifications: NotificationStore,
    chat: ChatStore,
    sync: CrossTabSync<SimInstant>,
    inbox: CacheSubscription,
}

impl Tab {
    fn open(shared: &SharedCache, id: u64, env: &SimEnv) -> Self {
        let mut notifications =
            NotificationStore::new(NotificationStoreConfig::default(), shared.tab(TabId::new(id)));
        let mut chat = ChatStore::new(ChatStoreConfig::default(), shared.tab(TabId::new(id)));
        notifications.initialize(env.wall_clock());
        chat.initialize("me".into());
        notifications.take_actions();
        chat.take_actions();

        let sync = CrossTabSync::new(shared.tab(TabId::new(id)));
        let inbox = sync.subscribe();
        Self { id, notifications, chat, sync, inbox }
    }

    /// Write this tab's queued broadcasts. Other actions are dropped.
    fn flush(&mut self, env: &SimEnv) {
        let mut actions = self.notifications.take_actions();
        actions.extend(self.chat.take_actions());
        for action in actions {
            if let StoreAction::Broadcast(message) = action {
                self.sync
                    .broadcast(&message, env.now(), env.wall_clock())
                    .expect("memory cache write");
            }
        }
    }

    /// Replay everything other tabs wrote since the last call.
    fn receive(&mut self, env: &SimEnv) -> Vec<CrossTabMessage> {
        let mut applied = Vec::new();
        while let Some(change) = self.inbox.try_next() {
            let Some(message) = CrossTabMessage::decode(&change, env.wall_clock()) else {
                continue;
            };
            match message.channel() {
                ChannelKind::Notification => self.notifications.apply_remote(&message),
                ChannelKind::Chat => self.chat.apply_remote(&message),
            }
            applied.push(message);
        }
        applied
    }

    fn snapshot(&self) -> TabSnapshot {
        TabSnapshot::capture(self.id, &self.notifications, &self.chat)
    }
}

fn both(a: &Tab, b: &Tab) -> SystemSnapshot {
    let mut state = SystemSnapshot::single(a.snapshot());
    state.add_tab(b.snapshot());
    state
}

fn registry() -> InvariantRegistry {
    let mut registry = InvariantRegistry::standard();
    registry.add(ReadFlagsConverge);
    registry
}

#[test]
fn notification_arrival_and_read_converge() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    let incoming = fixtures::notification("n1", false, 0);
    a.notifications.on_realtime(&RealtimeEvent::NewNotification(incoming), env.wall_clock());
    a.flush(&env);
    b.receive(&env);

    assert_eq!(b.notifications.notifications().len(), 1);
    assert_eq!(b.notifications.unread_count(), 1);

    b.notifications.mark_as_read(&"n1".into()).expect("valid id");
    b.flush(&env);
    let applied = a.receive(&env);

    assert_eq!(applied, vec![CrossTabMessage::NotificationRead { notification_id: "n1".into() }]);
    assert_eq!(a.notifications.unread_count(), 0);
    registry().assert_all(&both(&a, &b), "after cross-tab read");
}

#[test]
fn remote_mutations_are_not_rebroadcast() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    a.notifications.on_realtime(
        &RealtimeEvent::NewNotification(fixtures::notification("n1", false, 0)),
        env.wall_clock(),
    );
    a.flush(&env);
    b.receive(&env);

    let echoed = b.notifications.take_actions();
    assert!(echoed.iter().all(|action| !matches!(
        action,
        StoreAction::Broadcast(_) | StoreAction::Request { .. }
    )));
}

#[test]
fn chat_message_counts_unread_in_every_tab() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    let message = fixtures::chat_message("m1", "c1", "alice", 5, false);
    a.chat.on_realtime(&RealtimeEvent::ChatMessage(message));
    a.flush(&env);
    b.receive(&env);

    assert_eq!(a.chat.total_unread(), 1);
    assert_eq!(b.chat.total_unread(), 1);
    assert_eq!(b.chat.messages(&"c1".into()).len(), 1);

    a.chat.mark_conversation_as_read(&"c1".into()).expect("valid id");
    a.flush(&env);
    b.chat.take_actions();
    b.receive(&env);

    assert_eq!(b.chat.unread_count(&"c1".into()), 0);
    assert_eq!(b.chat.total_unread(), 0);
    let echoed = b.chat.take_actions();
    assert!(echoed.iter().all(|action| !matches!(
        action,
        StoreAction::Broadcast(_) | StoreAction::Request { .. }
    )));
    registry().assert_all(&both(&a, &b), "after conversation read");
}

#[test]
fn duplicate_delivery_in_both_tabs_is_ignored() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    // Both tabs hold their own subscription, so the broker delivers twice.
    let message = fixtures::chat_message("m1", "c1", "alice", 5, false);
    a.chat.on_realtime(&RealtimeEvent::ChatMessage(message.clone()));
    b.chat.on_realtime(&RealtimeEvent::ChatMessage(message));
    a.flush(&env);
    b.flush(&env);
    a.receive(&env);
    b.receive(&env);

    assert_eq!(a.chat.total_unread(), 1);
    assert_eq!(b.chat.total_unread(), 1);
    registry().assert_all(&both(&a, &b), "after duplicate delivery");
}

#[test]
fn entries_expire_after_their_lifetime() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    a.notifications.mark_all_as_read();
    a.flush(&env);
    let key = CrossTabMessage::NotificationsAllRead.key();
    assert!(shared.tab(TabId::new(3)).get(&key).expect("memory read").is_some());
    assert_eq!(a.sync.next_deadline(), Some(env.now() + Duration::from_millis(100)));

    env.advance(Duration::from_millis(100));
    assert_eq!(a.sync.tick(env.now()), 1);
    assert!(shared.tab(TabId::new(3)).get(&key).expect("memory read").is_none());

    // The write is replayed once; the removal decodes to nothing.
    let applied = b.receive(&env);
    assert_eq!(applied, vec![CrossTabMessage::NotificationsAllRead]);
}

#[test]
fn stale_connection_status_is_ignored() {
    let env = SimEnv::default();
    let shared = SharedCache::in_memory();
    let mut a = Tab::open(&shared, 1, &env);
    let mut b = Tab::open(&shared, 2, &env);

    a.sync
        .broadcast(
            &CrossTabMessage::Connection { channel: ChannelKind::Chat, connected: true },
            env.now(),
            env.wall_clock(),
        )
        .expect("memory cache write");
    env.advance(Duration::from_secs(6 * 60));

    assert!(b.receive(&env).is_empty());
}
