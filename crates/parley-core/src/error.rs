//! Error types for credentials, transport and cache.

use parley_proto::FrameError;
use thiserror::Error;

/// Credential problems.
///
/// Never retried. Callers surface these immediately and the embedding
/// application is expected to force a fresh login.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token available from the identity provider.
    #[error("no authentication token")]
    MissingToken,

    /// No user id available from the identity provider.
    #[error("no user id")]
    MissingUserId,

    /// Token `exp` claim is in the past.
    #[error("token expired at {expired_at} (now {now})")]
    Expired {
        /// `exp` claim, seconds since epoch.
        expired_at: i64,
        /// Local clock at the time of the check.
        now: i64,
    },

    /// Token could not be decoded. Treated the same as an expired token.
    #[error("malformed token: {reason}")]
    Malformed {
        /// Decoding failure.
        reason: String,
    },

    /// Broker rejected the credentials.
    #[error("credentials rejected: {message}")]
    Rejected {
        /// Broker's error message.
        message: String,
    },
}

/// Errors from the realtime transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Operation needs an established session.
    #[error("transport not connected")]
    NotConnected,

    /// Credential failure before or during connect.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Received bytes were not a valid frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Automatic reconnection gave up.
    #[error("connection failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// Socket failed to open or closed abnormally.
    #[error("socket error: {reason}")]
    Socket {
        /// Description from the socket layer.
        reason: String,
    },
}

impl TransportError {
    /// Whether the error should end automatic reconnection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::RetriesExhausted { .. })
    }
}

/// Persistent cache failures.
///
/// The cache is best-effort: callers log these and carry on with in-memory
/// state.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend storage failed.
    #[error("cache I/O error: {0}")]
    Io(String),

    /// Stored value could not be (de)serialized.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
