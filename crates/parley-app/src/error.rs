//! Runtime errors.

use parley_client::StoreError;
use parley_core::{AuthError, CacheError};
use thiserror::Error;

/// Errors surfaced by the runtime and its handle.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime task has exited.
    #[error("parley runtime stopped")]
    Stopped,

    /// The session was ended while the request was pending.
    #[error("session ended")]
    SessionEnded,

    /// Cache could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// No usable session.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<RuntimeError> for StoreError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Auth(auth) => auth.into(),
            other => StoreError::new(other.to_string()),
        }
    }
}
