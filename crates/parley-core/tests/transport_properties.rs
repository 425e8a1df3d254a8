//! Property-based tests for the transport state machine
//!
//! Drives a transport through arbitrary sequences of socket events, timer
//! ticks and user calls, checking the state invariants after every step.

use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use parley_core::{
    Credentials, SocketId, Transport, TransportAction, TransportConfig, TransportEvent,
    TransportState,
};
use proptest::prelude::*;

const UNIX_NOW: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
enum Step {
    Connect,
    Open,
    Handshake,
    Close,
    StaleClose,
    Advance(u64),
    Subscribe,
    ManualReconnect,
    Disconnect,
}

fn arbitrary_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Connect),
        Just(Step::Open),
        Just(Step::Handshake),
        Just(Step::Close),
        Just(Step::StaleClose),
        (0u64..40_000).prop_map(Step::Advance),
        Just(Step::Subscribe),
        Just(Step::ManualReconnect),
        Just(Step::Disconnect),
    ]
}

fn credentials() -> Credentials {
    let claims = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{}}}", UNIX_NOW + 3600));
    Credentials::new(format!("h.{claims}.s"), "u1").unwrap()
}

struct Harness {
    transport: Transport,
    now: Instant,
    socket: Option<SocketId>,
    stale: Option<SocketId>,
    emitted_connected: u32,
}

impl Harness {
    fn apply(&mut self, actions: Vec<TransportAction>) {
        for action in actions {
            match action {
                TransportAction::OpenSocket { socket, .. } => {
                    self.stale = self.socket.replace(socket);
                },
                TransportAction::CloseSocket { socket } if self.socket == Some(socket) => {
                    self.stale = self.socket.take();
                },
                TransportAction::Emit(TransportEvent::Connected { .. }) => {
                    self.emitted_connected += 1;
                },
                _ => {},
            }
        }
    }

    fn step(&mut self, step: Step) {
        let actions = match step {
            Step::Connect => {
                self.transport.connect(credentials(), "ws://broker", self.now, UNIX_NOW).unwrap()
            },
            Step::Open => match self.socket {
                Some(socket) => self.transport.on_socket_open(socket, self.now),
                None => vec![],
            },
            Step::Handshake => match self.socket {
                Some(socket) => self
                    .transport
                    .on_socket_data(socket, b"CONNECTED\nheart-beat:4000,4000\n\n\0", self.now)
                    .unwrap(),
                None => vec![],
            },
            Step::Close => match self.socket {
                Some(socket) => self.transport.on_socket_closed(socket, self.now, "reset"),
                None => vec![],
            },
            Step::StaleClose => match self.stale {
                Some(socket) => {
                    let actions = self.transport.on_socket_closed(socket, self.now, "late");
                    assert!(actions.is_empty(), "stale socket produced {actions:?}");
                    actions
                },
                None => vec![],
            },
            Step::Advance(ms) => {
                self.now += Duration::from_millis(ms);
                self.transport.tick(self.now)
            },
            Step::Subscribe => {
                let connected = self.transport.is_connected();
                let result = self.transport.subscribe("/topic/x");
                assert_eq!(result.is_ok(), connected);
                result.map(|(_, actions)| actions).unwrap_or_default()
            },
            Step::ManualReconnect => {
                self.transport.manual_reconnect(self.now, UNIX_NOW).unwrap_or_default()
            },
            Step::Disconnect => self.transport.disconnect(),
        };
        self.apply(actions);
    }

    fn check(&self) {
        let t = &self.transport;
        let max = t.config().max_reconnect_attempts;

        assert!(t.attempt() <= max, "attempt {} over budget {max}", t.attempt());
        if t.is_exhausted() {
            assert_eq!(t.state(), TransportState::Disconnected);
        }
        if t.state() == TransportState::Disconnected {
            assert!(t.next_deadline().is_none());
            assert_eq!(t.subscription_count(), 0);
        }
        if !t.is_connected() {
            assert_eq!(t.subscription_count(), 0);
        }
        if let TransportState::Reconnecting { attempt } = t.state() {
            assert_eq!(attempt, t.attempt());
            assert!(attempt >= 1 && attempt < max);
        }
    }
}

/// Property: state invariants hold after every step of any event sequence
#[test]
fn prop_transport_invariants() {
    proptest!(|(steps in prop::collection::vec(arbitrary_step(), 1..60))| {
        let mut harness = Harness {
            transport: Transport::new(TransportConfig::default()),
            now: Instant::now(),
            socket: None,
            stale: None,
            emitted_connected: 0,
        };

        for step in steps {
            harness.step(step);
            harness.check();
        }
    });
}

/// Property: a clean connect emits exactly one Connected event
#[test]
fn prop_single_connected_per_session() {
    proptest!(|(repeats in 1usize..5)| {
        let mut harness = Harness {
            transport: Transport::new(TransportConfig::default()),
            now: Instant::now(),
            socket: None,
            stale: None,
            emitted_connected: 0,
        };

        for _ in 0..repeats {
            harness.step(Step::Connect);
        }
        harness.step(Step::Open);
        harness.step(Step::Handshake);
        harness.step(Step::Handshake);

        prop_assert_eq!(harness.emitted_connected, 1);
    });
}
