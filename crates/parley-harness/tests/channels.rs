//! Channels and stores over the simulated broker
//!
//! A synchronous driver wires transport events into both channel managers
//! and channel events into both stores, the same routing the async runtime
//! performs, so full realtime flows run in virtual time.

use std::time::Duration;

use parley_client::{
    ApiRequest, ChannelKind, ChatChannel, ChatStore, ChatStoreConfig, NotificationChannel,
    NotificationStore, NotificationStoreConfig, RealtimeEvent, StoreAction, WireCommand,
    channel::SYSTEM_CONNECTED_NOTICE,
};
use parley_core::{
    Environment, ReconnectionStatus, SharedCache, TabId, Transport, TransportAction,
    TransportConfig, TransportEvent,
};
use parley_harness::{
    InvariantRegistry, SimBroker, SimEnv, SimInstant, SystemSnapshot, TabSnapshot, fixtures,
};
use parley_proto::{OutgoingMessage, destination};
use serde_json::json;

const ME: &str = "u1";
const ENDPOINT: &str = "ws://broker/ws";

struct Session {
    env: SimEnv,
    broker: SimBroker,
    transport: Transport<SimInstant>,
    notification_channel: NotificationChannel,
    chat_channel: ChatChannel,
    notifications: NotificationStore,
    chat: ChatStore,
    requests: Vec<ApiRequest>,
    published: Vec<RealtimeEvent>,
}

impl Session {
    fn start() -> Self {
        let cache = SharedCache::in_memory();
        let mut session = Self {
            env: SimEnv::default(),
            broker: SimBroker::new(),
            transport: Transport::new(TransportConfig::default()),
            notification_channel: NotificationChannel::new(),
            chat_channel: ChatChannel::new(),
            notifications: NotificationStore::new(
                NotificationStoreConfig::default(),
                cache.tab(TabId::new(1)),
            ),
            chat: ChatStore::new(ChatStoreConfig::default(), cache.tab(TabId::new(1))),
            requests: Vec::new(),
            published: Vec::new(),
        };
        session.notification_channel.initialize(());
        session.chat_channel.initialize(());
        session.notifications.initialize(session.env.wall_clock());
        session.chat.initialize(ME.into());
        session.pump();
        session
    }

    fn run(&mut self, actions: Vec<TransportAction>) {
        let events = self.broker.drive(&mut self.transport, actions, self.env.now());
        for event in events {
            self.on_transport_event(event);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { .. } => {
                let actions = self.notification_channel.on_connected(&mut self.transport);
                self.run(actions);
                let actions = self.chat_channel.on_connected(&mut self.transport);
                self.run(actions);
            },
            TransportEvent::Disconnected { .. } => {
                self.notification_channel.on_disconnected();
                self.chat_channel.on_disconnected();
            },
            TransportEvent::Reconnection(status) => {
                self.dispatch(RealtimeEvent::Reconnection(status));
            },
            TransportEvent::Message { subscription, body, .. } => {
                let wall = self.env.wall_clock();
                let _ = self.notification_channel.handle_delivery(subscription, &body, wall)
                    || self.chat_channel.handle_delivery(subscription, &body, wall);
            },
            TransportEvent::ServerError { message } => {
                self.dispatch(RealtimeEvent::Error { channel: None, message });
            },
            TransportEvent::Failed(err) => {
                self.dispatch(RealtimeEvent::Error { channel: None, message: err.to_string() });
            },
        }
    }

    fn dispatch(&mut self, event: RealtimeEvent) {
        self.notifications.on_realtime(&event, self.env.wall_clock());
        self.chat.on_realtime(&event);
        self.published.push(event);
    }

    /// Drain store actions and channel events until both are quiet.
    fn pump(&mut self) {
        loop {
            let mut actions = self.notifications.take_actions();
            actions.extend(self.chat.take_actions());
            let mut events = self.notification_channel.take_events();
            events.extend(self.chat_channel.take_events());
            if actions.is_empty() && events.is_empty() {
                break;
            }

            for action in actions {
                self.execute(action);
            }
            for event in events {
                self.dispatch(event);
            }
        }
    }

    fn execute(&mut self, action: StoreAction) {
        match action {
            StoreAction::Request { request, .. } => self.requests.push(request),
            StoreAction::Connect(kind) => {
                let credentials = fixtures::credentials(ME);
                let (now, unix_now) = (self.env.now(), self.env.unix_now());
                let result = match kind {
                    ChannelKind::Notification => self.notification_channel.connect(
                        &mut self.transport,
                        credentials,
                        ENDPOINT,
                        now,
                        unix_now,
                    ),
                    ChannelKind::Chat => {
                        self.chat_channel.connect(&mut self.transport, credentials, ENDPOINT, now, unix_now)
                    },
                };
                self.run(result.expect("fresh credentials"));
            },
            StoreAction::Disconnect(kind) => {
                let actions = match kind {
                    ChannelKind::Notification => {
                        self.notification_channel.disconnect(&mut self.transport)
                    },
                    ChannelKind::Chat => self.chat_channel.disconnect(&mut self.transport),
                };
                self.run(actions);
            },
            StoreAction::Wire { ticket, command } => {
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
                let status = result.map(|actions| self.run(actions));
                if let Some(ticket) = ticket {
                    self.chat.wire_result(ticket, status);
                }
            },
            StoreAction::Publish(event) => self.published.push(event),
            StoreAction::Broadcast(_) => {},
        }
    }

    fn deliver(&mut self, destination: &str, body: &str) {
        let events = self.broker.deliver(&mut self.transport, destination, body, self.env.now());
        for event in events {
            self.on_transport_event(event);
        }
        self.pump();
    }

    fn sever(&mut self) {
        let events = self.broker.sever(&mut self.transport, self.env.now());
        for event in events {
            self.on_transport_event(event);
        }
        self.pump();
    }

    /// Advance to the next transport deadline and run it.
    fn step_timer(&mut self) {
        if let Some(deadline) = self.transport.next_deadline() {
            self.env.advance_to(deadline);
        }
        let actions = self.transport.tick(self.env.now());
        self.run(actions);
        self.pump();
    }

    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::single(TabSnapshot::capture(1, &self.notifications, &self.chat))
    }
}

fn chat_body(id: &str, conversation: &str, sender: &str) -> String {
    let message = fixtures::chat_message(id, conversation, sender, 10, false);
    fixtures::chat_message_json(&message).to_string()
}

#[test]
fn both_channels_share_one_session() {
    let session = Session::start();

    assert!(session.transport.is_connected());
    assert_eq!(session.broker.connects(), 1);
    assert_eq!(session.transport.lease_count(), 2);
    for topic in [
        destination::user_topic(&ME.into()),
        destination::USER_STATUS.to_string(),
        destination::USER_ERRORS.to_string(),
        destination::chat_topic(&ME.into()),
        destination::chat_unread_topic(&ME.into()),
        destination::chat_read_status_topic(&ME.into()),
        destination::CHAT_STATUS.to_string(),
        destination::CHAT_ERRORS.to_string(),
    ] {
        assert!(session.broker.is_subscribed(&topic), "missing {topic}");
    }
    assert_eq!(session.broker.subscription_count(), 8);
    assert_eq!(session.broker.sent_to(destination::NOTIFICATIONS_SUBSCRIBE).len(), 1);
    assert_eq!(session.broker.sent_to(destination::CHAT_SUBSCRIBE).len(), 1);
    assert!(session.notifications.is_connected());
    assert!(session.chat.is_connected());
}

#[test]
fn notification_delivery_reaches_the_store() {
    let mut session = Session::start();
    let inbox = destination::user_topic(&ME.into());

    let notice = json!({ "id": "sys", "content": SYSTEM_CONNECTED_NOTICE, "read": false });
    session.deliver(&inbox, &notice.to_string());
    assert!(session.notifications.notifications().is_empty());

    let body = fixtures::notification_json(&fixtures::notification("n1", false, 3)).to_string();
    session.deliver(&inbox, &body);
    session.deliver(&inbox, &body);

    assert_eq!(session.notifications.notifications().len(), 1);
    assert_eq!(session.notifications.unread_count(), 1);
    InvariantRegistry::standard().assert_all(&session.snapshot(), "after notification delivery");
}

#[test]
fn notification_read_is_mirrored_over_the_socket() {
    let mut session = Session::start();
    let body = fixtures::notification_json(&fixtures::notification("n1", false, 3)).to_string();
    session.deliver(&destination::user_topic(&ME.into()), &body);

    session.notifications.mark_as_read(&"n1".into()).expect("valid id");
    session.pump();

    assert_eq!(session.notifications.unread_count(), 0);
    assert_eq!(session.broker.sent_to(destination::NOTIFICATIONS_MARK_READ), vec!["n1".to_string()]);
    assert!(session.requests.contains(&ApiRequest::MarkNotificationRead("n1".into())));
}

#[test]
fn chat_delivery_counts_unread_and_reads_back() {
    let mut session = Session::start();
    let topic = destination::chat_topic(&ME.into());

    session.deliver(&topic, &chat_body("m1", "c1", "alice"));
    session.deliver(&topic, &chat_body("m2", "c1", "alice"));
    session.deliver(&topic, &chat_body("m3", "c1", ME));

    assert_eq!(session.chat.messages(&"c1".into()).len(), 3);
    assert_eq!(session.chat.unread_count(&"c1".into()), 2);
    assert_eq!(session.chat.total_unread(), 2);

    session.chat.mark_conversation_as_read(&"c1".into()).expect("valid id");
    session.pump();

    assert_eq!(session.chat.total_unread(), 0);
    assert_eq!(
        session.broker.sent_to(destination::CHAT_MARK_CONVERSATION_READ),
        vec!["c1".to_string()]
    );
    InvariantRegistry::standard().assert_all(&session.snapshot(), "after conversation read");
}

#[test]
fn open_conversation_reads_on_arrival() {
    let mut session = Session::start();
    session.chat.set_visible(true);
    session.chat.set_active_conversation(Some("c1".into()));
    session.pump();

    session.deliver(&destination::chat_topic(&ME.into()), &chat_body("m1", "c1", "alice"));

    assert_eq!(session.chat.total_unread(), 0);
    assert_eq!(session.broker.sent_to(destination::CHAT_MARK_READ), vec!["m1".to_string()]);
}

#[test]
fn send_prefers_the_socket() {
    let mut session = Session::start();

    let outgoing = OutgoingMessage { receiver_id: "alice".into(), content: "hello".to_string() };
    session.chat.send_message(outgoing).expect("valid message");
    session.pump();

    let sent = session.broker.sent_to(destination::CHAT_SEND);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("hello"));
    assert!(!session.requests.iter().any(|r| matches!(r, ApiRequest::SendMessage(_))));
}

#[test]
fn send_falls_back_to_rest_while_offline() {
    let mut session = Session::start();
    session.broker.set_accepting(false);
    session.sever();

    let outgoing = OutgoingMessage { receiver_id: "alice".into(), content: "later".to_string() };
    session.chat.send_message(outgoing.clone()).expect("valid message");
    session.pump();

    assert!(session.broker.sent_to(destination::CHAT_SEND).is_empty());
    assert!(session.requests.contains(&ApiRequest::SendMessage(outgoing)));
}

#[test]
fn unread_push_updates_counters() {
    let mut session = Session::start();
    let body = json!({ "totalUnreadCount": 5, "conversationId": "c1", "conversationUnreadCount": 2 });

    session.deliver(&destination::chat_unread_topic(&ME.into()), &body.to_string());

    assert_eq!(session.chat.total_unread(), 5);
    assert_eq!(session.chat.unread_count(&"c1".into()), 2);
    assert_eq!(session.chat.counters().unattributed(), 3);
    InvariantRegistry::standard().assert_all(&session.snapshot(), "after unread push");
}

#[test]
fn reconnect_resubscribes_and_resyncs() {
    let mut session = Session::start();
    session.requests.clear();

    session.sever();
    assert!(!session.chat.is_connected());
    assert_eq!(session.broker.subscription_count(), 0);

    session.step_timer();

    assert!(session.transport.is_connected());
    assert_eq!(session.env.elapsed(), Duration::from_secs(1));
    assert_eq!(session.broker.subscription_count(), 8);
    assert!(session.chat.is_connected());
    assert!(session.published.iter().any(|event| matches!(
        event,
        RealtimeEvent::Reconnection(ReconnectionStatus::Succeeded { attempts: 1 })
    )));
    assert!(session.requests.contains(&ApiRequest::ChatUnreadCount));
}

#[test]
fn receipts_queued_while_offline_flush_on_reconnect() {
    let mut session = Session::start();
    session.deliver(&destination::chat_topic(&ME.into()), &chat_body("m1", "c1", "alice"));

    session.sever();
    session.chat.mark_message_as_read(&"m1".into()).expect("valid id");
    session.pump();
    assert_eq!(session.chat.queued_receipts(), &[WireCommand::MarkMessageRead("m1".into())]);
    assert!(session.broker.sent_to(destination::CHAT_MARK_READ).is_empty());

    session.step_timer();

    assert!(session.chat.queued_receipts().is_empty());
    assert_eq!(session.broker.sent_to(destination::CHAT_MARK_READ), vec!["m1".to_string()]);
}

#[test]
fn releasing_both_leases_closes_the_socket() {
    let mut session = Session::start();

    session.notifications.cleanup();
    session.chat.cleanup();
    session.pump();

    assert!(!session.transport.is_connected());
    assert_eq!(session.transport.lease_count(), 0);
    assert_eq!(session.broker.open_sockets(), 0);
}
