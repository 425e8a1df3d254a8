//! Core
//!
//! Sans-IO building blocks shared by every parley client: the realtime
//! transport state machine, credentials, the retry policy and the persistent
//! cache.
//!
//! # Architecture
//!
//! State machines here never perform I/O or read the clock. Callers pass the
//! current instant in and execute the returned actions:
//!
//! ```text
//! driver ──(now, socket events)──> Transport ──> Vec<TransportAction> ──> driver
//! ```
//!
//! The only async code is [`retry_with_backoff`], which sleeps through an
//! [`Environment`] so tests can run it on virtual time.
//!
//! # Components
//!
//! - [`Transport`]: one multiplexed STOMP session with reconnection
//! - [`Backoff`] / [`RetryPolicy`]: the shared delay schedule
//! - [`Credentials`] / [`IdentityProvider`]: session lookup and expiry checks
//! - [`cache`]: key/value persistence with cross-tab change events

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod auth;
mod backoff;
pub mod cache;
pub mod env;
mod error;
pub mod transport;

pub use auth::{Credentials, IdentityProvider, check_token, token_expiry};
pub use backoff::{
    Backoff, RetryOutcome, RetryPolicy, Retryable, is_retryable_status, retry_with_backoff,
};
pub use cache::{CacheBackend, CacheChange, SharedCache, TabCache, TabId};
pub use env::{Environment, MonotonicInstant};
pub use error::{AuthError, CacheError, TransportError};
pub use transport::{
    ReconnectionStatus, SocketId, SubscriptionHandle, Transport, TransportAction, TransportConfig,
    TransportEvent, TransportState,
};
