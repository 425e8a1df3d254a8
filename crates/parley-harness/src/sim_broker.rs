//! In-memory STOMP broker.
//!
//! `SimBroker` speaks wire bytes, so everything the transport encodes goes
//! through the real codec. It can be driven two ways:
//!
//! - synchronously, with [`SimBroker::drive`] executing a transport's actions
//!   and feeding the broker's replies straight back (Sans-IO tests)
//! - asynchronously, behind a [`BrokerConnector`] that implements
//!   [`SocketConnector`] for the production runtime

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use parley_client::{SocketConnector, SocketEvent, SocketLink, socket::Outbound};
use parley_core::{MonotonicInstant, SocketId, Transport, TransportAction, TransportEvent};
use parley_proto::{Command, Frame, HEARTBEAT, HeartBeat, Inbound};
use tokio::sync::mpsc;

/// A SEND frame the broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Socket it arrived on.
    pub socket: SocketId,
    /// Target destination.
    pub destination: String,
    /// Body text.
    pub body: String,
}

#[derive(Debug, Default)]
struct Session {
    connected: bool,
    token: Option<String>,
    /// Subscription id to destination.
    subscriptions: BTreeMap<String, String>,
}

/// Single-node STOMP broker.
#[derive(Debug)]
pub struct SimBroker {
    sessions: HashMap<SocketId, Session>,
    accepting: bool,
    rejection: Option<String>,
    heartbeat: HeartBeat,
    published: Vec<Published>,
    dropped: Vec<SocketId>,
    heartbeats: usize,
    connects: usize,
    next_message: u64,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    /// Broker that accepts every connection, with heart-beats disabled.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            accepting: true,
            rejection: None,
            heartbeat: HeartBeat::DISABLED,
            published: Vec::new(),
            dropped: Vec::new(),
            heartbeats: 0,
            connects: 0,
            next_message: 1,
        }
    }

    /// Refuse (or accept again) new sockets.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    /// Answer every CONNECT with an ERROR carrying `message`; `None` accepts.
    pub fn set_rejection(&mut self, message: Option<&str>) {
        self.rejection = message.map(str::to_string);
    }

    /// Heart-beat capability advertised in CONNECTED.
    pub fn set_heartbeat(&mut self, heartbeat: HeartBeat) {
        self.heartbeat = heartbeat;
    }

    /// A client socket arrived. Returns `false` if refused.
    pub fn open(&mut self, socket: SocketId) -> bool {
        if !self.accepting {
            tracing::debug!(socket = socket.get(), "broker refused socket");
            return false;
        }
        self.sessions.insert(socket, Session::default());
        true
    }

    /// The client closed `socket`.
    pub fn close(&mut self, socket: SocketId) {
        self.sessions.remove(&socket);
    }

    /// Bytes from the client. Returns the replies for the same socket.
    pub fn receive(&mut self, socket: SocketId, data: &[u8]) -> Vec<Vec<u8>> {
        if !self.sessions.contains_key(&socket) {
            return vec![];
        }
        let frame = match Frame::decode(data) {
            Ok(Inbound::Frame(frame)) => frame,
            Ok(Inbound::Heartbeat) => {
                self.heartbeats += 1;
                return vec![];
            },
            Err(err) => {
                tracing::warn!(socket = socket.get(), error = %err, "broker got garbage");
                return vec![error_frame("malformed frame").encode()];
            },
        };

        match frame.command {
            Command::Connect | Command::Stomp => self.on_connect(socket, &frame),
            Command::Subscribe => {
                if let (Some(id), Some(destination), Some(session)) =
                    (frame.get("id"), frame.get("destination"), self.sessions.get_mut(&socket))
                {
                    session.subscriptions.insert(id.to_string(), destination.to_string());
                }
                vec![]
            },
            Command::Unsubscribe => {
                if let (Some(id), Some(session)) = (frame.get("id"), self.sessions.get_mut(&socket)) {
                    session.subscriptions.remove(id);
                }
                vec![]
            },
            Command::Send => {
                self.published.push(Published {
                    socket,
                    destination: frame.get("destination").unwrap_or_default().to_string(),
                    body: frame.body_str().unwrap_or_default().to_string(),
                });
                vec![]
            },
            Command::Disconnect => {
                self.sessions.remove(&socket);
                vec![]
            },
            other => {
                tracing::debug!(command = %other, "broker ignoring frame");
                vec![]
            },
        }
    }

    fn on_connect(&mut self, socket: SocketId, frame: &Frame) -> Vec<Vec<u8>> {
        if let Some(message) = self.rejection.clone() {
            self.sessions.remove(&socket);
            self.dropped.push(socket);
            return vec![error_frame(&message).encode()];
        }

        self.connects += 1;
        if let Some(session) = self.sessions.get_mut(&socket) {
            session.connected = true;
            session.token = frame.get("token").map(str::to_string);
        }
        let reply = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", self.heartbeat.header_value());
        vec![reply.encode()]
    }

    /// Deliver `body` to every subscriber of `destination`.
    pub fn publish(&mut self, destination: &str, body: &str) -> Vec<(SocketId, Vec<u8>)> {
        let mut deliveries = Vec::new();
        for (socket, session) in &self.sessions {
            if !session.connected {
                continue;
            }
            for (id, subscribed) in &session.subscriptions {
                if subscribed != destination {
                    continue;
                }
                let frame = Frame::new(Command::Message)
                    .header("subscription", id.clone())
                    .header("message-id", self.next_message.to_string())
                    .header("destination", destination)
                    .header("content-type", "application/json")
                    .with_body(body.to_string());
                self.next_message += 1;
                deliveries.push((*socket, frame.encode()));
            }
        }
        deliveries.sort_by_key(|(socket, _)| *socket);
        deliveries
    }

    /// Broker-side ERROR for `socket` (the connection stays open).
    pub fn error_for(&self, socket: SocketId, message: &str) -> Option<Vec<u8>> {
        self.sessions.contains_key(&socket).then(|| error_frame(message).encode())
    }

    /// Kill every connection. Returns the sockets that were open.
    pub fn drop_all(&mut self) -> Vec<SocketId> {
        let mut sockets: Vec<_> = self.sessions.drain().map(|(socket, _)| socket).collect();
        sockets.sort();
        sockets
    }

    /// Sockets closed by the broker since the last call.
    pub fn take_dropped(&mut self) -> Vec<SocketId> {
        std::mem::take(&mut self.dropped)
    }

    /// Whether the broker closed `socket`; clears the mark.
    pub fn take_drop(&mut self, socket: SocketId) -> bool {
        let before = self.dropped.len();
        self.dropped.retain(|s| *s != socket);
        self.dropped.len() != before
    }

    /// Every SEND received, in arrival order.
    pub fn published(&self) -> &[Published] {
        &self.published
    }

    /// Bodies sent to `destination`.
    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|p| p.destination == destination)
            .map(|p| p.body.clone())
            .collect()
    }

    /// Whether any live session subscribes to `destination`.
    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.sessions.values().any(|s| s.subscriptions.values().any(|d| d == destination))
    }

    /// Subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions.values().map(|s| s.subscriptions.len()).sum()
    }

    /// Open sockets, connected or not.
    pub fn open_sockets(&self) -> usize {
        self.sessions.len()
    }

    /// Successful CONNECT handshakes so far.
    pub fn connects(&self) -> usize {
        self.connects
    }

    /// Heart-beats received so far.
    pub fn heartbeats(&self) -> usize {
        self.heartbeats
    }

    /// Token presented by the session on `socket`.
    pub fn token(&self, socket: SocketId) -> Option<&str> {
        self.sessions.get(&socket)?.token.as_deref()
    }

    /// Execute `actions` against this broker until the transport is quiet.
    /// Returns the events the transport emitted, in order.
    pub fn drive<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        actions: Vec<TransportAction>,
        now: I,
    ) -> Vec<TransportEvent> {
        let mut queue: VecDeque<_> = actions.into();
        let mut events = Vec::new();

        while let Some(action) = queue.pop_front() {
            let more = match action {
                TransportAction::OpenSocket { socket, .. } => {
                    if self.open(socket) {
                        transport.on_socket_open(socket, now)
                    } else {
                        transport.on_socket_closed(socket, now, "connection refused")
                    }
                },
                TransportAction::SendFrame { socket, frame } => {
                    let replies = self.receive(socket, &frame.encode());
                    self.feed(transport, socket, replies, now)
                },
                TransportAction::SendHeartbeat { socket } => {
                    self.receive(socket, HEARTBEAT);
                    vec![]
                },
                TransportAction::CloseSocket { socket } => {
                    self.close(socket);
                    vec![]
                },
                TransportAction::Emit(event) => {
                    events.push(event);
                    vec![]
                },
            };
            queue.extend(more);
        }
        events
    }

    /// Publish through the broker and drive the resulting deliveries.
    pub fn deliver<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        destination: &str,
        body: &str,
        now: I,
    ) -> Vec<TransportEvent> {
        let mut actions = Vec::new();
        for (socket, bytes) in self.publish(destination, body) {
            actions.extend(self.feed(transport, socket, vec![bytes], now));
        }
        self.drive(transport, actions, now)
    }

    /// Kill every connection and tell the transport.
    pub fn sever<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        now: I,
    ) -> Vec<TransportEvent> {
        let mut actions = Vec::new();
        for socket in self.drop_all() {
            actions.extend(transport.on_socket_closed(socket, now, "connection lost"));
        }
        self.drive(transport, actions, now)
    }

    fn feed<I: MonotonicInstant>(
        &mut self,
        transport: &mut Transport<I>,
        socket: SocketId,
        replies: Vec<Vec<u8>>,
        now: I,
    ) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        for reply in replies {
            match transport.on_socket_data(socket, &reply, now) {
                Ok(more) => actions.extend(more),
                Err(err) => tracing::warn!(error = %err, "transport rejected broker frame"),
            }
        }
        for dropped in self.take_dropped() {
            actions.extend(transport.on_socket_closed(dropped, now, "closed by broker"));
        }
        actions
    }
}

fn error_frame(message: &str) -> Frame {
    Frame::new(Command::Error).header("message", message)
}

/// Broker shared between tests and a [`BrokerConnector`].
pub type SharedBroker = Arc<Mutex<SimBroker>>;

/// Create a broker ready to share.
pub fn shared_broker() -> SharedBroker {
    Arc::new(Mutex::new(SimBroker::new()))
}

fn lock(broker: &SharedBroker) -> MutexGuard<'_, SimBroker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

type Sinks = Arc<Mutex<HashMap<SocketId, mpsc::UnboundedSender<SocketEvent>>>>;

/// [`SocketConnector`] whose sockets end in a [`SimBroker`].
///
/// Each opened socket runs a small task that forwards writes to the broker
/// and its replies back as [`SocketEvent`]s. Requires a tokio runtime.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    broker: SharedBroker,
    sinks: Sinks,
}

impl BrokerConnector {
    /// Connector for `broker`.
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker, sinks: Arc::default() }
    }

    /// The broker behind this connector.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Publish to subscribers of `destination`. Returns how many deliveries
    /// were made.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let deliveries = lock(&self.broker).publish(destination, body);
        let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        deliveries
            .into_iter()
            .filter(|(socket, bytes)| {
                sinks
                    .get(socket)
                    .is_some_and(|sink| sink.send(SocketEvent::Data(*socket, bytes.clone())).is_ok())
            })
            .count()
    }

    /// Kill every connection as if the network dropped.
    pub fn sever(&self) {
        let sockets = lock(&self.broker).drop_all();
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        for socket in sockets {
            if let Some(sink) = sinks.remove(&socket) {
                let _ = sink.send(SocketEvent::Closed(socket, "connection lost".to_string()));
            }
        }
    }
}

impl SocketConnector for BrokerConnector {
    fn open(
        &mut self,
        socket: SocketId,
        endpoint: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketLink {
        let (link, mut outbound) = SocketLink::pair();

        if !lock(&self.broker).open(socket) {
            let _ = events.send(SocketEvent::Closed(socket, format!("{endpoint} refused")));
            return link;
        }
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(socket, events.clone());
        let _ = events.send(SocketEvent::Opened(socket));

        let broker = Arc::clone(&self.broker);
        let sinks = Arc::clone(&self.sinks);
        tokio::spawn(async move {
            while let Some(out) = outbound.recv().await {
                let (replies, dropped) = {
                    let mut broker = lock(&broker);
                    match out {
                        Outbound::Data(data) => {
                            let replies = broker.receive(socket, &data);
                            (replies, broker.take_drop(socket))
                        },
                        Outbound::Close => {
                            broker.close(socket);
                            (vec![], true)
                        },
                    }
                };
                for reply in replies {
                    let _ = events.send(SocketEvent::Data(socket, reply));
                }
                if dropped {
                    break;
                }
            }
            sinks.lock().unwrap_or_else(PoisonError::into_inner).remove(&socket);
            let _ = events.send(SocketEvent::Closed(socket, "closed".to_string()));
        });

        link
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parley_core::{Credentials, TransportConfig, TransportState};

    use super::*;
    use crate::fixtures::jwt;

    fn credentials() -> Credentials {
        Credentials::new(jwt(i64::MAX / 2), "u1").unwrap()
    }

    fn connected() -> (SimBroker, Transport, Instant) {
        let mut broker = SimBroker::new();
        let mut transport = Transport::new(TransportConfig::default());
        let now = Instant::now();
        let actions = transport.connect(credentials(), "ws://sim", now, 0).unwrap();
        let events = broker.drive(&mut transport, actions, now);
        assert!(events.contains(&TransportEvent::Connected { reconnected: false }));
        (broker, transport, now)
    }

    #[test]
    fn handshake_and_token() {
        let (broker, transport, _) = connected();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(broker.connects(), 1);
        assert_eq!(broker.open_sockets(), 1);
    }

    #[test]
    fn subscribe_then_deliver() {
        let (mut broker, mut transport, now) = connected();
        let (handle, actions) = transport.subscribe("/topic/x").unwrap();
        broker.drive(&mut transport, actions, now);
        assert!(broker.is_subscribed("/topic/x"));

        let events = broker.deliver(&mut transport, "/topic/x", "{\"a\":1}", now);
        assert_eq!(
            events,
            vec![TransportEvent::Message {
                subscription: handle,
                destination: "/topic/x".to_string(),
                body: "{\"a\":1}".to_string(),
            }]
        );
        assert!(broker.deliver(&mut transport, "/topic/y", "{}", now).is_empty());
    }

    #[test]
    fn send_is_recorded() {
        let (mut broker, mut transport, now) = connected();
        let actions = transport.send("/app/chat/ping", "ping", "text/plain").unwrap();
        broker.drive(&mut transport, actions, now);
        assert_eq!(broker.sent_to("/app/chat/ping"), vec!["ping".to_string()]);
    }

    #[test]
    fn rejection_is_terminal() {
        let mut broker = SimBroker::new();
        broker.set_rejection(Some("Invalid token"));
        let mut transport = Transport::new(TransportConfig::default());
        let now = Instant::now();
        let actions = transport.connect(credentials(), "ws://sim", now, 0).unwrap();
        let events = broker.drive(&mut transport, actions, now);

        assert!(events.iter().any(|e| matches!(e, TransportEvent::Failed(err) if err.is_terminal())));
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(broker.open_sockets(), 0);
    }

    #[test]
    fn sever_schedules_reconnect() {
        let (mut broker, mut transport, now) = connected();
        let events = broker.sever(&mut transport, now);
        assert!(events.iter().any(|e| matches!(e, TransportEvent::Disconnected { will_retry: true, .. })));
        assert_eq!(transport.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn connector_round_trip() {
        let broker = shared_broker();
        let mut connector = BrokerConnector::new(Arc::clone(&broker));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut transport = Transport::new(TransportConfig::default());
        let now = Instant::now();
        let Some(TransportAction::OpenSocket { socket, endpoint }) =
            transport.connect(credentials(), "ws://sim", now, 0).unwrap().into_iter().next()
        else {
            panic!("expected OpenSocket");
        };
        let link = connector.open(socket, &endpoint, tx);
        assert_eq!(rx.recv().await, Some(SocketEvent::Opened(socket)));

        let Some(TransportAction::SendFrame { frame, .. }) =
            transport.on_socket_open(socket, now).into_iter().next()
        else {
            panic!("expected CONNECT");
        };
        assert!(link.send(frame.encode()));
        let Some(SocketEvent::Data(_, reply)) = rx.recv().await else {
            panic!("expected CONNECTED");
        };
        transport.on_socket_data(socket, &reply, now).unwrap();
        assert!(transport.is_connected());

        connector.sever();
        assert!(matches!(rx.recv().await, Some(SocketEvent::Closed(..))));
    }
}
