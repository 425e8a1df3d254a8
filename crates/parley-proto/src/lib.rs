//! Wire protocol for parley.
//!
//! Realtime traffic is STOMP 1.2 over a WebSocket. This crate owns everything
//! that touches bytes or JSON on that connection:
//!
//! - [`Frame`] encode/decode with header escaping and heart-beats
//! - [`HeartBeat`] negotiation
//! - [`destination`] naming for per-user topics and application endpoints
//! - typed ids and the validated domain [`model`]
//! - the [`payload`] parse boundary that turns inbound JSON into domain
//!   records or a [`ParseError`]
//!
//! It performs no I/O and holds no state.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod destination;
mod errors;
mod frame;
mod heartbeat;
mod ids;
pub mod model;
pub mod payload;
pub mod timestamp;

pub use errors::{FrameError, ParseError, Result};
pub use frame::{Command, Frame, HEARTBEAT, Inbound, escape, unescape};
pub use heartbeat::{HeartBeat, Negotiated};
pub use ids::{ConversationId, MessageId, NotificationId, UserId};
pub use model::{
    ChatMessage, Conversation, Notification, NotificationPreference, OutgoingMessage,
    ReadStatusUpdate, UnreadCountUpdate,
};
pub use payload::{Ack, AckKind, StatusReply};
