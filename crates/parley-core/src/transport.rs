//! Realtime transport state machine.
//!
//! One multiplexed STOMP session per tab. Uses the action pattern: methods
//! take time as input and return [`TransportAction`]s for the driver to
//! execute (open/close a socket, write a frame, emit an event). No I/O
//! happens here.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//! ┌──────────────┐─────────>┌────────────┐  CONNECTED  ┌───────────┐
//! │ Disconnected │          │ Connecting │────────────>│ Connected │
//! └──────────────┘<─────┐   └────────────┘             └───────────┘
//!        ^              │      │      ^                      │
//!        │ attempts     │      │ drop │ timer                │ drop
//!        │ exhausted    │      ↓      │                      ↓
//!        │              │   ┌──────────────────────┐         │
//!        └──────────────┴───│ Reconnecting(attempt)│<────────┘
//!                           └──────────────────────┘
//! ```
//!
//! Every socket gets a fresh [`SocketId`]. Callbacks carrying an id other than
//! the current one belong to an abandoned socket and are ignored, so a slow
//! close from a previous attempt can never tear down the current one.
//!
//! Subscriptions are bound to one session. Any drop clears them and callers
//! re-subscribe from their `Connected` handling.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::{Duration, Instant},
};

use parley_proto::{Command, Frame, HeartBeat, Inbound, Negotiated, UserId};
use serde::Serialize;

use crate::{
    auth::Credentials,
    backoff::Backoff,
    env::MonotonicInstant,
    error::{AuthError, TransportError},
};

/// Time allowed between opening a socket and receiving CONNECTED.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Missed server heart-beats tolerated before the socket is considered dead.
pub const DEFAULT_HEARTBEAT_GRACE: u32 = 2;

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Heart-beat intervals advertised at connect.
    pub heartbeat: HeartBeat,
    /// Time allowed for the STOMP handshake.
    pub connect_timeout: Duration,
    /// Attempt budget; reaching it is terminal until a manual reconnect.
    pub max_reconnect_attempts: u32,
    /// Reconnect delay schedule.
    pub backoff: Backoff,
    /// Multiplier applied to the server heart-beat interval.
    pub heartbeat_grace: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartBeat::DEFAULT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: Backoff::transport(),
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
        }
    }
}

/// Identifies one socket incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Raw generation number.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Opaque subscription handle. Rendered as the STOMP subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    fn parse(id: &str) -> Option<Self> {
        id.strip_prefix("sub-").and_then(|n| n.parse().ok()).map(Self)
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket and no reconnect pending.
    Disconnected,
    /// Socket opening or STOMP handshake in flight.
    Connecting,
    /// Session established.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting {
        /// Failed attempts so far.
        attempt: u32,
    },
}

/// Progress of automatic or manual reconnection, for UI display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ReconnectionStatus {
    /// A reconnect is scheduled.
    #[serde(rename_all = "camelCase")]
    Scheduled {
        /// Failed attempts so far.
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
        /// Delay before the next attempt.
        next_attempt_in: Duration,
    },
    /// A reconnect attempt is starting.
    #[serde(rename_all = "camelCase")]
    Attempting {
        /// Failed attempts so far (0 for manual).
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
        /// Triggered by the user rather than the timer.
        manual: bool,
    },
    /// Session re-established.
    #[serde(rename_all = "camelCase")]
    Succeeded {
        /// Failed attempts before success.
        attempts: u32,
    },
    /// Budget spent; only a manual reconnect resumes.
    #[serde(rename_all = "camelCase")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Attempt budget.
        max_attempts: u32,
    },
}

/// Events surfaced to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// STOMP session established. Subscriptions must be (re)created now.
    Connected {
        /// Whether an earlier session existed.
        reconnected: bool,
    },
    /// An established session ended.
    Disconnected {
        /// Human-readable cause.
        reason: String,
        /// Whether a reconnect is scheduled.
        will_retry: bool,
    },
    /// Reconnection progress.
    Reconnection(ReconnectionStatus),
    /// Delivery on a live subscription.
    Message {
        /// Subscription it arrived on.
        subscription: SubscriptionHandle,
        /// Destination reported by the broker.
        destination: String,
        /// UTF-8 body.
        body: String,
    },
    /// Non-fatal ERROR frame from the broker.
    ServerError {
        /// Broker message.
        message: String,
    },
    /// Terminal failure; automatic reconnection has stopped.
    Failed(TransportError),
}

/// Actions for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Open a socket to `endpoint`; report back with `socket`.
    OpenSocket {
        /// Incarnation to report in callbacks.
        socket: SocketId,
        /// WebSocket URL.
        endpoint: String,
    },
    /// Write a frame.
    SendFrame {
        /// Target socket.
        socket: SocketId,
        /// Frame to encode.
        frame: Frame,
    },
    /// Write a heart-beat EOL.
    SendHeartbeat {
        /// Target socket.
        socket: SocketId,
    },
    /// Close the socket. No further callbacks for it are expected.
    CloseSocket {
        /// Socket to close.
        socket: SocketId,
    },
    /// Deliver an event upward.
    Emit(TransportEvent),
}

/// Realtime transport state machine.
///
/// Generic over the instant type so simulations can drive it with virtual
/// time.
#[derive(Debug)]
pub struct Transport<I = Instant> {
    config: TransportConfig,
    state: TransportState,
    credentials: Option<Credentials>,
    endpoint: Option<String>,
    socket: Option<SocketId>,
    next_socket: u64,
    attempt: u32,
    exhausted: bool,
    recovering: bool,
    ever_connected: bool,
    reconnect_at: Option<I>,
    connect_deadline: Option<I>,
    heartbeat: Negotiated,
    last_sent: Option<I>,
    last_received: Option<I>,
    subscriptions: BTreeMap<SubscriptionHandle, String>,
    next_subscription: u64,
    leases: BTreeSet<&'static str>,
}

impl<I: MonotonicInstant> Transport<I> {
    /// Create a disconnected transport.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Disconnected,
            credentials: None,
            endpoint: None,
            socket: None,
            next_socket: 0,
            attempt: 0,
            exhausted: false,
            recovering: false,
            ever_connected: false,
            reconnect_at: None,
            connect_deadline: None,
            heartbeat: Negotiated::default(),
            last_sent: None,
            last_received: None,
            subscriptions: BTreeMap::new(),
            next_subscription: 0,
            leases: BTreeSet::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Whether a STOMP session is established.
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    /// Failed attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether automatic reconnection has given up.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// User the current credentials belong to.
    pub fn user_id(&self) -> Option<&UserId> {
        self.credentials.as_ref().map(Credentials::user_id)
    }

    /// Live subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Destination of a live subscription.
    pub fn subscription_destination(&self, handle: SubscriptionHandle) -> Option<&str> {
        self.subscriptions.get(&handle).map(String::as_str)
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Establish a session.
    ///
    /// Idempotent while connecting or connected. A connect during the backoff
    /// wait starts the attempt immediately.
    ///
    /// # Errors
    ///
    /// - `TransportError::Auth` if the token is expired or malformed; nothing
    ///   is sent in that case
    pub fn connect(
        &mut self,
        credentials: Credentials,
        endpoint: impl Into<String>,
        now: I,
        unix_now: i64,
    ) -> Result<Vec<TransportAction>, TransportError> {
        credentials.check_expiry(unix_now)?;

        match self.state {
            TransportState::Connected | TransportState::Connecting => {
                tracing::debug!(state = ?self.state, "connect ignored");
                return Ok(vec![]);
            },
            TransportState::Disconnected => {
                self.attempt = 0;
                self.exhausted = false;
                self.recovering = false;
            },
            TransportState::Reconnecting { .. } => {},
        }

        self.credentials = Some(credentials);
        self.endpoint = Some(endpoint.into());
        self.reconnect_at = None;

        Ok(self.open_socket(now))
    }

    /// Socket `socket` finished opening; start the STOMP handshake.
    pub fn on_socket_open(&mut self, socket: SocketId, now: I) -> Vec<TransportAction> {
        if self.socket != Some(socket) || self.state != TransportState::Connecting {
            tracing::debug!(socket = socket.0, "ignoring open from stale socket");
            return vec![];
        }

        let Some(credentials) = &self.credentials else {
            return vec![];
        };

        self.last_received = Some(now);

        let frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("heart-beat", self.config.heartbeat.header_value())
            .header("Authorization", credentials.bearer())
            .header("token", credentials.token());

        vec![TransportAction::SendFrame { socket, frame }]
    }

    /// Bytes arrived on `socket`.
    ///
    /// # Errors
    ///
    /// - `TransportError::Frame` if the bytes are not a valid STOMP frame; the
    ///   frame is dropped and the session continues
    pub fn on_socket_data(
        &mut self,
        socket: SocketId,
        data: &[u8],
        now: I,
    ) -> Result<Vec<TransportAction>, TransportError> {
        if self.socket != Some(socket) {
            return Ok(vec![]);
        }
        self.last_received = Some(now);

        let Inbound::Frame(frame) = Frame::decode(data)? else {
            return Ok(vec![]);
        };

        match frame.command {
            Command::Connected => Ok(self.handle_connected(&frame, now)),
            Command::Message => self.handle_message(&frame),
            Command::Error => Ok(self.handle_error_frame(&frame)),
            Command::Receipt => Ok(vec![]),
            other => {
                tracing::debug!(command = %other, "ignoring unexpected frame");
                Ok(vec![])
            },
        }
    }

    /// Socket `socket` closed or failed to open.
    pub fn on_socket_closed(&mut self, socket: SocketId, now: I, reason: &str) -> Vec<TransportAction> {
        if self.socket != Some(socket) {
            tracing::debug!(socket = socket.0, "ignoring close from stale socket");
            return vec![];
        }
        self.handle_drop(now, reason)
    }

    /// Timers: reconnect, handshake timeout, heart-beats.
    pub fn tick(&mut self, now: I) -> Vec<TransportAction> {
        match self.state {
            TransportState::Disconnected => vec![],
            TransportState::Reconnecting { attempt } => {
                if !self.reconnect_at.is_some_and(|at| now >= at) {
                    return vec![];
                }
                self.reconnect_at = None;
                if self.credentials.is_none() {
                    self.state = TransportState::Disconnected;
                    return vec![];
                }

                tracing::info!(attempt, "reconnecting");
                self.recovering = true;
                let mut actions = vec![TransportAction::Emit(TransportEvent::Reconnection(
                    ReconnectionStatus::Attempting {
                        attempt,
                        max_attempts: self.config.max_reconnect_attempts,
                        manual: false,
                    },
                ))];
                actions.extend(self.open_socket(now));
                actions
            },
            TransportState::Connecting => {
                if !self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    return vec![];
                }
                tracing::warn!("connect timed out");
                let mut actions = self.close_current();
                actions.extend(self.handle_drop(now, "connect timeout"));
                actions
            },
            TransportState::Connected => self.tick_heartbeat(now),
        }
    }

    /// Earliest instant at which [`Transport::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<I> {
        match self.state {
            TransportState::Disconnected => None,
            TransportState::Reconnecting { .. } => self.reconnect_at,
            TransportState::Connecting => self.connect_deadline,
            TransportState::Connected => {
                let send = self.heartbeat.send_every.zip(self.last_sent).map(|(every, at)| at + every);
                let expect = self
                    .heartbeat
                    .expect_every
                    .zip(self.last_received)
                    .map(|(every, at)| at + every * self.config.heartbeat_grace);
                match (send, expect) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            },
        }
    }

    /// Subscribe to `destination`.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` unless connected
    pub fn subscribe(
        &mut self,
        destination: impl Into<String>,
    ) -> Result<(SubscriptionHandle, Vec<TransportAction>), TransportError> {
        let socket = self.connected_socket()?;
        let destination = destination.into();

        let handle = SubscriptionHandle(self.next_subscription);
        self.next_subscription += 1;

        let frame = Frame::new(Command::Subscribe)
            .header("id", handle.to_string())
            .header("destination", destination.clone())
            .header("ack", "auto");
        self.subscriptions.insert(handle, destination);

        Ok((handle, vec![TransportAction::SendFrame { socket, frame }]))
    }

    /// Cancel a subscription. Unknown handles are a no-op.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Vec<TransportAction> {
        if self.subscriptions.remove(&handle).is_none() {
            return vec![];
        }
        match self.connected_socket() {
            Ok(socket) => {
                let frame = Frame::new(Command::Unsubscribe).header("id", handle.to_string());
                vec![TransportAction::SendFrame { socket, frame }]
            },
            Err(_) => vec![],
        }
    }

    /// Fire-and-forget publish.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotConnected` unless connected
    pub fn send(
        &mut self,
        destination: &str,
        body: impl Into<String>,
        content_type: &str,
    ) -> Result<Vec<TransportAction>, TransportError> {
        let socket = self.connected_socket()?;
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", content_type)
            .with_body(body.into());
        Ok(vec![TransportAction::SendFrame { socket, frame }])
    }

    /// Tear everything down. Idempotent; always succeeds.
    pub fn disconnect(&mut self) -> Vec<TransportAction> {
        let was_connected = self.is_connected();
        let mut actions = Vec::new();

        if let Some(socket) = self.socket.take() {
            if was_connected {
                actions.push(TransportAction::SendFrame {
                    socket,
                    frame: Frame::new(Command::Disconnect),
                });
            }
            actions.push(TransportAction::CloseSocket { socket });
        }

        self.state = TransportState::Disconnected;
        self.credentials = None;
        self.endpoint = None;
        self.attempt = 0;
        self.exhausted = false;
        self.recovering = false;
        self.reconnect_at = None;
        self.connect_deadline = None;
        self.heartbeat = Negotiated::default();
        self.subscriptions.clear();
        self.leases.clear();

        if was_connected {
            tracing::info!("transport disconnected");
            actions.push(TransportAction::Emit(TransportEvent::Disconnected {
                reason: "disconnect requested".to_string(),
                will_retry: false,
            }));
        }
        actions
    }

    /// Reset the attempt counter and connect now, bypassing backoff.
    ///
    /// # Errors
    ///
    /// - `TransportError::Auth` if no credentials are held or they expired
    pub fn manual_reconnect(
        &mut self,
        now: I,
        unix_now: i64,
    ) -> Result<Vec<TransportAction>, TransportError> {
        let credentials = self.credentials.clone().ok_or(AuthError::MissingToken)?;
        if let Err(err) = credentials.check_expiry(unix_now) {
            self.credentials = None;
            return Err(err.into());
        }

        let was_connected = self.is_connected();
        let mut actions = self.close_current();
        if was_connected {
            actions.push(TransportAction::Emit(TransportEvent::Disconnected {
                reason: "manual reconnect".to_string(),
                will_retry: true,
            }));
        }

        self.attempt = 0;
        self.exhausted = false;
        self.recovering = true;
        self.reconnect_at = None;
        self.subscriptions.clear();

        tracing::info!("manual reconnect");
        actions.push(TransportAction::Emit(TransportEvent::Reconnection(
            ReconnectionStatus::Attempting {
                attempt: 0,
                max_attempts: self.config.max_reconnect_attempts,
                manual: true,
            },
        )));
        actions.extend(self.open_socket(now));
        Ok(actions)
    }

    /// Register a user of the shared connection. Returns `false` if the
    /// holder already had a lease.
    pub fn acquire(&mut self, holder: &'static str) -> bool {
        self.leases.insert(holder)
    }

    /// Drop a lease; the last release disconnects.
    pub fn release(&mut self, holder: &'static str) -> Vec<TransportAction> {
        if self.leases.remove(holder) && self.leases.is_empty() {
            self.disconnect()
        } else {
            vec![]
        }
    }

    /// Active leases.
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn connected_socket(&self) -> Result<SocketId, TransportError> {
        match (self.state, self.socket) {
            (TransportState::Connected, Some(socket)) => Ok(socket),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn open_socket(&mut self, now: I) -> Vec<TransportAction> {
        let socket = SocketId(self.next_socket);
        self.next_socket += 1;

        self.socket = Some(socket);
        self.state = TransportState::Connecting;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        self.last_sent = None;
        self.last_received = None;

        let endpoint = self.endpoint.clone().unwrap_or_default();
        tracing::debug!(socket = socket.0, %endpoint, "opening socket");
        vec![TransportAction::OpenSocket { socket, endpoint }]
    }

    /// Close the current socket without scheduling anything.
    fn close_current(&mut self) -> Vec<TransportAction> {
        self.socket.take().map(|socket| TransportAction::CloseSocket { socket }).into_iter().collect()
    }

    fn handle_connected(&mut self, frame: &Frame, now: I) -> Vec<TransportAction> {
        if self.state != TransportState::Connecting {
            tracing::debug!(state = ?self.state, "ignoring CONNECTED");
            return vec![];
        }

        let server = frame
            .get("heart-beat")
            .and_then(|value| HeartBeat::parse(value).ok())
            .unwrap_or(HeartBeat::DISABLED);
        self.heartbeat = self.config.heartbeat.negotiate(&server);

        self.state = TransportState::Connected;
        self.connect_deadline = None;
        self.last_sent = Some(now);
        self.subscriptions.clear();

        let reconnected = self.ever_connected;
        self.ever_connected = true;

        let mut actions = Vec::new();
        if std::mem::take(&mut self.recovering) {
            actions.push(TransportAction::Emit(TransportEvent::Reconnection(
                ReconnectionStatus::Succeeded { attempts: self.attempt },
            )));
        }
        self.attempt = 0;
        self.exhausted = false;

        tracing::info!(reconnected, heartbeat = ?self.heartbeat, "transport connected");
        actions.push(TransportAction::Emit(TransportEvent::Connected { reconnected }));
        actions
    }

    fn handle_message(&mut self, frame: &Frame) -> Result<Vec<TransportAction>, TransportError> {
        if self.state != TransportState::Connected {
            return Ok(vec![]);
        }

        let Some(subscription) = frame.get("subscription").and_then(SubscriptionHandle::parse)
        else {
            tracing::debug!("MESSAGE without a usable subscription header");
            return Ok(vec![]);
        };
        if !self.subscriptions.contains_key(&subscription) {
            tracing::debug!(%subscription, "MESSAGE for unknown subscription");
            return Ok(vec![]);
        }

        let body = frame.body_str()?.to_string();
        let destination = frame.get("destination").unwrap_or_default().to_string();

        Ok(vec![TransportAction::Emit(TransportEvent::Message { subscription, destination, body })])
    }

    fn handle_error_frame(&mut self, frame: &Frame) -> Vec<TransportAction> {
        let message = frame
            .get("message")
            .map(str::to_string)
            .or_else(|| {
                frame.body_str().ok().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
            })
            .unwrap_or_else(|| "unknown broker error".to_string());

        if !is_auth_failure(&message) {
            tracing::warn!(%message, "broker error");
            return vec![TransportAction::Emit(TransportEvent::ServerError { message })];
        }

        tracing::error!(%message, "broker rejected credentials");
        let leases = std::mem::take(&mut self.leases);
        let mut actions = self.disconnect();
        self.leases = leases;

        actions.push(TransportAction::Emit(TransportEvent::Failed(TransportError::Auth(
            AuthError::Rejected { message },
        ))));
        actions
    }

    fn tick_heartbeat(&mut self, now: I) -> Vec<TransportAction> {
        let Some(socket) = self.socket else {
            return vec![];
        };

        if let (Some(expect), Some(last)) = (self.heartbeat.expect_every, self.last_received) {
            let limit = expect * self.config.heartbeat_grace;
            if now - last > limit {
                tracing::warn!(silence = ?(now - last), "heart-beat timeout");
                let mut actions = self.close_current();
                actions.extend(self.handle_drop(now, "heart-beat timeout"));
                return actions;
            }
        }

        match (self.heartbeat.send_every, self.last_sent) {
            (Some(every), Some(last)) if now - last < every => vec![],
            (Some(_), _) => {
                self.last_sent = Some(now);
                vec![TransportAction::SendHeartbeat { socket }]
            },
            (None, _) => vec![],
        }
    }

    /// Unexpected loss of the current socket.
    fn handle_drop(&mut self, now: I, reason: &str) -> Vec<TransportAction> {
        let was_connected = self.is_connected();

        self.socket = None;
        self.subscriptions.clear();
        self.heartbeat = Negotiated::default();
        self.connect_deadline = None;
        self.attempt += 1;

        let mut actions = Vec::new();

        if self.credentials.is_none() {
            self.state = TransportState::Disconnected;
            if was_connected {
                actions.push(TransportAction::Emit(TransportEvent::Disconnected {
                    reason: reason.to_string(),
                    will_retry: false,
                }));
            }
            return actions;
        }

        let max_attempts = self.config.max_reconnect_attempts;
        if self.attempt >= max_attempts {
            tracing::error!(attempts = self.attempt, %reason, "reconnect attempts exhausted");
            self.state = TransportState::Disconnected;
            self.exhausted = true;
            self.recovering = false;
            self.reconnect_at = None;

            if was_connected {
                actions.push(TransportAction::Emit(TransportEvent::Disconnected {
                    reason: reason.to_string(),
                    will_retry: false,
                }));
            }
            actions.push(TransportAction::Emit(TransportEvent::Reconnection(
                ReconnectionStatus::Exhausted { attempts: self.attempt, max_attempts },
            )));
            actions.push(TransportAction::Emit(TransportEvent::Failed(
                TransportError::RetriesExhausted { attempts: self.attempt },
            )));
            return actions;
        }

        let delay = self.config.backoff.delay(self.attempt);
        self.reconnect_at = Some(now + delay);
        self.state = TransportState::Reconnecting { attempt: self.attempt };
        tracing::warn!(attempt = self.attempt, ?delay, %reason, "connection lost, reconnect scheduled");

        if was_connected {
            actions.push(TransportAction::Emit(TransportEvent::Disconnected {
                reason: reason.to_string(),
                will_retry: true,
            }));
        }
        actions.push(TransportAction::Emit(TransportEvent::Reconnection(
            ReconnectionStatus::Scheduled {
                attempt: self.attempt,
                max_attempts,
                next_attempt_in: delay,
            },
        )));
        actions
    }
}

/// Broker error messages that mean the credentials are no good.
fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["401", "unauthorized", "unauthorised", "authentication", "expired", "invalid token", "jwt"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

    use super::*;

    const UNIX_NOW: i64 = 1_700_000_000;

    fn credentials() -> Credentials {
        let claims = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{}}}", UNIX_NOW + 3600));
        Credentials::new(format!("h.{claims}.s"), "u1").unwrap()
    }

    fn open_socket(actions: &[TransportAction]) -> SocketId {
        actions
            .iter()
            .find_map(|a| match a {
                TransportAction::OpenSocket { socket, .. } => Some(*socket),
                _ => None,
            })
            .unwrap()
    }

    fn connected(t: &mut Transport, now: Instant) -> SocketId {
        let actions = t.connect(credentials(), "ws://broker", now, UNIX_NOW).unwrap();
        let socket = open_socket(&actions);
        t.on_socket_open(socket, now);
        t.on_socket_data(socket, b"CONNECTED\nversion:1.2\nheart-beat:4000,4000\n\n\0", now)
            .unwrap();
        socket
    }

    fn events(actions: &[TransportAction]) -> Vec<&TransportEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                TransportAction::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_handshake() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());

        let actions = t.connect(credentials(), "ws://broker", now, UNIX_NOW).unwrap();
        assert_eq!(t.state(), TransportState::Connecting);
        let socket = open_socket(&actions);

        let actions = t.on_socket_open(socket, now);
        let [TransportAction::SendFrame { frame, .. }] = actions.as_slice() else {
            panic!("expected CONNECT frame, got {actions:?}");
        };
        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.get("heart-beat"), Some("4000,4000"));
        assert!(frame.get("Authorization").is_some_and(|v| v.starts_with("Bearer ")));

        let actions = t
            .on_socket_data(socket, b"CONNECTED\nversion:1.2\nheart-beat:4000,4000\n\n\0", now)
            .unwrap();
        assert!(t.is_connected());
        assert_eq!(events(&actions), vec![&TransportEvent::Connected { reconnected: false }]);
    }

    #[test]
    fn expired_token_rejected_without_io() {
        let mut t: Transport = Transport::new(TransportConfig::default());
        let claims = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{}}}", UNIX_NOW - 1));
        let creds = Credentials::new(format!("h.{claims}.s"), "u1").unwrap();

        let result = t.connect(creds, "ws://broker", Instant::now(), UNIX_NOW);
        assert!(matches!(result, Err(TransportError::Auth(AuthError::Expired { .. }))));
        assert_eq!(t.state(), TransportState::Disconnected);
    }

    #[test]
    fn connect_is_idempotent() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        t.connect(credentials(), "ws://broker", now, UNIX_NOW).unwrap();
        assert!(t.connect(credentials(), "ws://broker", now, UNIX_NOW).unwrap().is_empty());
    }

    #[test]
    fn subscribe_requires_connection() {
        let mut t: Transport = Transport::new(TransportConfig::default());
        assert_eq!(t.subscribe("/topic/x").unwrap_err(), TransportError::NotConnected);
        assert_eq!(
            t.send("/app/x", "body", "text/plain").unwrap_err(),
            TransportError::NotConnected
        );
    }

    #[test]
    fn message_routed_to_subscription() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        let socket = connected(&mut t, now);

        let (handle, _) = t.subscribe("/topic/user-u1").unwrap();
        let raw = format!("MESSAGE\nsubscription:{handle}\ndestination:/topic/user-u1\n\nhi\0");
        let actions = t.on_socket_data(socket, raw.as_bytes(), now).unwrap();

        assert_eq!(events(&actions), vec![&TransportEvent::Message {
            subscription: handle,
            destination: "/topic/user-u1".into(),
            body: "hi".into(),
        }]);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        connected(&mut t, now);
        let (handle, _) = t.subscribe("/topic/a").unwrap();

        assert_eq!(t.unsubscribe(handle).len(), 1);
        assert!(t.unsubscribe(handle).is_empty());
    }

    #[test]
    fn drop_schedules_backoff_then_gives_up() {
        let mut now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        let mut socket = connected(&mut t, now);
        let mut delays = Vec::new();

        loop {
            let actions = t.on_socket_closed(socket, now, "reset");
            if t.is_exhausted() {
                assert!(events(&actions).iter().any(|e| matches!(
                    e,
                    TransportEvent::Failed(TransportError::RetriesExhausted { attempts: 5 })
                )));
                break;
            }
            let Some(deadline) = t.next_deadline() else { panic!("no reconnect scheduled") };
            delays.push((deadline - now).as_millis());
            now = deadline;
            socket = open_socket(&t.tick(now));
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert_eq!(t.state(), TransportState::Disconnected);
    }

    #[test]
    fn stale_socket_callbacks_ignored() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        let old = connected(&mut t, now);

        t.manual_reconnect(now, UNIX_NOW).unwrap();
        assert!(t.on_socket_closed(old, now, "late close").is_empty());
        assert_eq!(t.state(), TransportState::Connecting);
    }

    #[test]
    fn manual_reconnect_resets_attempts() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig { max_reconnect_attempts: 1, ..Default::default() });
        let socket = connected(&mut t, now);

        t.on_socket_closed(socket, now, "reset");
        assert!(t.is_exhausted());

        let actions = t.manual_reconnect(now, UNIX_NOW).unwrap();
        assert!(!t.is_exhausted());
        assert_eq!(t.attempt(), 0);
        let socket = open_socket(&actions);

        t.on_socket_open(socket, now);
        let actions = t.on_socket_data(socket, b"CONNECTED\n\n\0", now).unwrap();
        assert_eq!(events(&actions), vec![
            &TransportEvent::Reconnection(ReconnectionStatus::Succeeded { attempts: 0 }),
            &TransportEvent::Connected { reconnected: true },
        ]);
    }

    #[test]
    fn heartbeats_sent_and_timeout_detected() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        let socket = connected(&mut t, now);

        assert!(t.tick(now + Duration::from_millis(3999)).is_empty());
        assert_eq!(t.tick(now + Duration::from_millis(4000)), vec![TransportAction::SendHeartbeat {
            socket
        }]);

        let actions = t.tick(now + Duration::from_millis(8001));
        assert!(actions.contains(&TransportAction::CloseSocket { socket }));
        assert_eq!(t.state(), TransportState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn connect_timeout_counts_as_failed_attempt() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        t.connect(credentials(), "ws://broker", now, UNIX_NOW).unwrap();

        t.tick(now + DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(t.state(), TransportState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn auth_error_frame_is_terminal() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        let socket = connected(&mut t, now);

        let actions =
            t.on_socket_data(socket, b"ERROR\nmessage:401 Unauthorized\n\n\0", now).unwrap();
        assert_eq!(t.state(), TransportState::Disconnected);
        assert!(t.user_id().is_none());
        assert!(events(&actions).iter().any(|e| matches!(e, TransportEvent::Failed(err) if err.is_terminal())));
        assert!(t.next_deadline().is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        connected(&mut t, now);

        assert!(!t.disconnect().is_empty());
        assert!(t.disconnect().is_empty());
    }

    #[test]
    fn last_lease_release_disconnects() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::default());
        t.acquire("chat");
        t.acquire("notification");
        connected(&mut t, now);

        assert!(t.release("chat").is_empty());
        assert!(t.is_connected());
        assert!(!t.release("notification").is_empty());
        assert!(!t.is_connected());
    }
}
