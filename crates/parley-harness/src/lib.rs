//! Deterministic simulation harness for parley.
//!
//! Deterministic stand-ins for everything the stores and the transport touch
//! outside themselves, so scenarios and property tests are reproducible:
//!
//! - [`SimEnv`]: virtual clock (sleep advances it instantly) and seeded RNG
//! - [`SimBroker`]: in-memory STOMP broker, driven synchronously or through
//!   [`BrokerConnector`] by the production runtime
//! - [`ScriptedApi`]: REST double with queued answers and a call log
//!
//! # Invariant Testing
//!
//! The `invariants` module checks behavioral properties of captured store
//! state. Use [`InvariantRegistry::standard()`] after every operation of a
//! property test.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod invariants;
pub mod scripted_api;
pub mod sim_broker;
pub mod sim_env;

pub use invariants::{
    ConversationBadgeMatchesScope, Invariant, InvariantRegistry, InvariantResult, MessageSnapshot,
    MessagesChronological, MessagesUniqueAndBounded, NotificationsUniqueAndBounded,
    ReadFlagsConverge, SystemSnapshot, TabSnapshot, UnreadTotalMatchesScopes, Violation,
};
pub use scripted_api::ScriptedApi;
pub use sim_broker::{BrokerConnector, Published, SharedBroker, SimBroker, shared_broker};
pub use sim_env::{SIM_EPOCH_SECS, SimEnv, SimInstant};
