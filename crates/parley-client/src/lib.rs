//! Client
//!
//! Realtime messaging and notification state for one browser-tab-like
//! session: channel managers on top of the shared [`parley_core::Transport`],
//! the REST model, domain stores and cross-tab synchronization.
//!
//! # Architecture
//!
//! Like [`parley_core`], nothing here performs I/O. Channels and stores take
//! inputs and queue outputs that a driver executes:
//!
//! ```text
//!              ┌──────────── TransportEvent::Message ───────────┐
//!              v                                                │
//! NotificationChannel / ChatChannel ── RealtimeEvent ──> stores + EventBus
//!                                                          │
//!     driver <── StoreAction (Request / Wire / Broadcast) ─┘
//!       │
//!       ├── RestApi::execute ──> store.complete(ticket, ..)
//!       └── CrossTabSync ──> other tabs ──> store.apply_remote(..)
//! ```
//!
//! # Components
//!
//! - [`NotificationChannel`] / [`ChatChannel`]: per-feature subscriptions
//! - [`NotificationStore`] / [`ChatStore`]: canonical in-tab state
//! - [`UnreadCounters`]: global and per-scope unread counts
//! - [`CrossTabSync`]: mutation replay between tabs
//! - [`EventBus`]: typed broadcast for views
//! - [`RestApi`]: REST execution seam
//!
//! # Optional features
//!
//! - `transport`: [`socket::WsConnector`] over tokio-tungstenite
//! - `http`: [`api::HttpApi`] over reqwest

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod api;
pub mod channel;
mod counters;
pub mod cross_tab;
mod error;
mod event;
pub mod socket;
pub mod store;

pub use api::{ApiRequest, ApiResponse, Page, RestApi};
pub use channel::{
    ChannelKind, ChatCallbacks, ChatChannel, NotificationCallbacks, NotificationChannel,
    WireCommand,
};
pub use counters::UnreadCounters;
pub use cross_tab::{CrossTabMessage, CrossTabSync};
pub use error::{ApiError, ChannelError, StoreError, StoreResult, ValidationError};
pub use event::{DEFAULT_BUS_CAPACITY, EventBus, RealtimeEvent};
pub use socket::{SocketConnector, SocketEvent, SocketLink};
pub use store::{
    ChatStore, ChatStoreConfig, Completed, NotificationStore, NotificationStoreConfig, Outcome,
    StoreAction, StoreStatus, Ticket,
};
