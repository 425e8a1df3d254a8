//! Parley runtime.
//!
//! Production glue around the Sans-IO pieces of [`parley_core`] and
//! [`parley_client`]: one tokio task owns the transport, both channels and
//! both stores, executes their actions against real sockets, REST and the
//! shared cache, and answers a clone-able [`ParleyHandle`].
//!
//! # Components
//!
//! - [`Runtime`]: single-task actor executing store and transport actions
//! - [`ParleyHandle`]: async command surface for views
//! - [`ParleyConfig`]: endpoints, cache location and tuning
//! - [`SystemEnv`]: production environment (tokio time, OS randomness)
//! - [`StaticIdentity`]: in-memory session source

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod command;
mod config;
mod error;
mod handle;
mod identity;
mod runtime;
mod system_env;

pub use command::{ChatSnapshot, NotificationSnapshot};
pub use config::{DEFAULT_API_BASE, DEFAULT_ENDPOINT, DEFAULT_TICK_INTERVAL, ParleyConfig};
pub use error::RuntimeError;
pub use handle::ParleyHandle;
pub use identity::StaticIdentity;
pub use runtime::Runtime;
pub use system_env::SystemEnv;
