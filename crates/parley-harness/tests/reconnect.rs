//! Transport reconnection against the simulated broker
//!
//! Virtual time moves only when the test advances it, so the reconnect
//! schedule is observed exactly.

use std::time::Duration;

use parley_core::{
    AuthError, Environment, ReconnectionStatus, Transport, TransportConfig, TransportError,
    TransportEvent, TransportState,
};
use parley_harness::{SimBroker, SimEnv, SimInstant, fixtures};

const ENDPOINT: &str = "ws://broker/ws";

fn connected(env: &SimEnv) -> (SimBroker, Transport<SimInstant>) {
    let mut broker = SimBroker::new();
    let mut transport = Transport::new(TransportConfig::default());
    let actions = transport
        .connect(fixtures::credentials("u1"), ENDPOINT, env.now(), env.unix_now())
        .expect("fresh credentials");
    let events = broker.drive(&mut transport, actions, env.now());
    assert_eq!(events, vec![TransportEvent::Connected { reconnected: false }]);
    (broker, transport)
}

fn scheduled_delays(events: &[TransportEvent]) -> Vec<Duration> {
    events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::Reconnection(ReconnectionStatus::Scheduled {
                next_attempt_in, ..
            }) => Some(*next_attempt_in),
            _ => None,
        })
        .collect()
}

/// Advance to each reconnect deadline in turn until none is left.
fn run_until_idle(
    env: &SimEnv,
    broker: &mut SimBroker,
    transport: &mut Transport<SimInstant>,
) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Some(deadline) = transport.next_deadline() {
        if transport.is_connected() {
            break;
        }
        env.advance_to(deadline);
        let actions = transport.tick(env.now());
        events.extend(broker.drive(transport, actions, env.now()));
    }
    events
}

#[test]
fn backoff_doubles_until_exhausted() {
    let env = SimEnv::default();
    let (mut broker, mut transport) = connected(&env);

    broker.set_accepting(false);
    let mut events = broker.sever(&mut transport, env.now());
    assert!(events.contains(&TransportEvent::Disconnected {
        reason: "connection lost".to_string(),
        will_retry: true,
    }));

    events.extend(run_until_idle(&env, &mut broker, &mut transport));

    assert_eq!(scheduled_delays(&events), vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
    ]);
    assert!(events.contains(&TransportEvent::Reconnection(ReconnectionStatus::Exhausted {
        attempts: 5,
        max_attempts: 5,
    })));
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert!(transport.is_exhausted());
    assert_eq!(env.elapsed(), Duration::from_secs(15));

    // Nothing further is scheduled once exhausted.
    assert_eq!(transport.next_deadline(), None);
    assert!(transport.tick(env.now() + Duration::from_secs(3600)).is_empty());
}

#[test]
fn recovers_when_broker_returns() {
    let env = SimEnv::default();
    let (mut broker, mut transport) = connected(&env);

    broker.set_accepting(false);
    broker.sever(&mut transport, env.now());

    // First retry at +1s is refused, the second at +3s succeeds.
    env.advance(Duration::from_secs(1));
    let actions = transport.tick(env.now());
    broker.drive(&mut transport, actions, env.now());
    assert_eq!(transport.state(), TransportState::Reconnecting { attempt: 2 });

    broker.set_accepting(true);
    let events = run_until_idle(&env, &mut broker, &mut transport);

    assert!(transport.is_connected());
    assert!(events.contains(&TransportEvent::Connected { reconnected: true }));
    assert!(events.contains(&TransportEvent::Reconnection(ReconnectionStatus::Succeeded {
        attempts: 2,
    })));
    assert_eq!(env.elapsed(), Duration::from_secs(3));
    assert_eq!(broker.connects(), 2);
}

#[test]
fn manual_reconnect_resets_an_exhausted_transport() {
    let env = SimEnv::default();
    let (mut broker, mut transport) = connected(&env);

    broker.set_accepting(false);
    broker.sever(&mut transport, env.now());
    run_until_idle(&env, &mut broker, &mut transport);
    assert!(transport.is_exhausted());

    broker.set_accepting(true);
    let actions = transport.manual_reconnect(env.now(), env.unix_now()).expect("credentials held");
    let events = broker.drive(&mut transport, actions, env.now());

    assert!(transport.is_connected());
    assert!(!transport.is_exhausted());
    assert_eq!(transport.attempt(), 0);
    assert!(events.contains(&TransportEvent::Reconnection(ReconnectionStatus::Attempting {
        attempt: 0,
        max_attempts: 5,
        manual: true,
    })));
    assert!(events.contains(&TransportEvent::Connected { reconnected: true }));
}

#[test]
fn subscriptions_are_rebuilt_by_the_caller_after_reconnect() {
    let env = SimEnv::default();
    let (mut broker, mut transport) = connected(&env);

    let (_, actions) = transport.subscribe("/topic/chat-u1").expect("connected");
    broker.drive(&mut transport, actions, env.now());
    assert!(broker.is_subscribed("/topic/chat-u1"));

    broker.sever(&mut transport, env.now());
    assert_eq!(transport.subscription_count(), 0);

    run_until_idle(&env, &mut broker, &mut transport);
    assert!(transport.is_connected());
    assert!(!broker.is_subscribed("/topic/chat-u1"));
}

#[test]
fn broker_auth_rejection_stops_reconnecting() {
    let env = SimEnv::default();
    let mut broker = SimBroker::new();
    broker.set_rejection(Some("Invalid token"));
    let mut transport = Transport::new(TransportConfig::default());

    let actions = transport
        .connect(fixtures::credentials("u1"), ENDPOINT, env.now(), env.unix_now())
        .expect("locally valid");
    let events = broker.drive(&mut transport, actions, env.now());

    assert!(events.iter().any(|event| matches!(
        event,
        TransportEvent::Failed(TransportError::Auth(AuthError::Rejected { .. }))
    )));
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert_eq!(transport.next_deadline(), None);
    assert_eq!(broker.connects(), 0);
    assert_eq!(broker.open_sockets(), 0);
}

#[test]
fn expired_token_never_reaches_the_broker() {
    let env = SimEnv::default();
    let mut transport: Transport<SimInstant> = Transport::new(TransportConfig::default());
    let expired = parley_core::Credentials::new(fixtures::jwt(env.unix_now() - 60), "u1")
        .expect("well formed");

    let err = transport.connect(expired, ENDPOINT, env.now(), env.unix_now()).unwrap_err();

    assert!(err.is_terminal());
    assert_eq!(transport.state(), TransportState::Disconnected);
}
