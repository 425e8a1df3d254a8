//! Error types for channels, REST calls and stores.

use parley_core::{AuthError, Retryable, TransportError, is_retryable_status};
use parley_proto::ParseError;
use thiserror::Error;

/// Client-side input rejected before anything is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Outgoing message has no recipient.
    #[error("recipient is required")]
    MissingReceiver,

    /// Outgoing message is blank.
    #[error("message content is required")]
    EmptyContent,

    /// Outgoing message exceeds the length limit.
    #[error("message is {len} characters, limit is {max}")]
    ContentTooLong {
        /// Characters in the message.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Recipient is the sender.
    #[error("cannot send a message to yourself")]
    SelfSend,

    /// A required id argument was blank.
    #[error("{field} is required")]
    MissingId {
        /// Argument name.
        field: &'static str,
    },
}

/// Failures of channel manager operations.
///
/// `NotConnected` is the signal for stores to fall back to REST.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Input failed validation; the transport was not touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// `connect` called before `initialize`.
    #[error("channel not initialized")]
    NotInitialized,

    /// No live session to send on.
    #[error("not connected")]
    NotConnected,

    /// Transport rejected the operation.
    #[error(transparent)]
    Transport(TransportError),

    /// Outgoing frame body could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Whether the caller should retry over REST instead.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// Whether the failure is a credential problem.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Auth(_)))
    }
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

/// Failures of REST calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request never produced a response.
    #[error("network error: {reason}")]
    Network {
        /// Lower-layer description.
        reason: String,
    },

    /// 401.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Server message, possibly empty.
        message: String,
    },

    /// 404.
    #[error("not found: {message}")]
    NotFound {
        /// Server message, possibly empty.
        message: String,
    },

    /// Any other non-success status.
    #[error("request failed with status {status}: {message}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Server message, possibly empty.
        message: String,
    },

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify a non-success status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized { message },
            404 => Self::NotFound { message },
            _ => Self::Status { status, message },
        }
    }

    /// HTTP status, when there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::NotFound { .. } => Some(404),
            Self::Status { status, .. } => Some(*status),
            Self::Network { .. } | Self::Decode(_) => None,
        }
    }

    /// Whether the session must be re-established.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether the resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        let server = |message: &str, fallback: &str| {
            if message.trim().is_empty() { fallback.to_string() } else { message.to_string() }
        };

        match self {
            Self::Network { .. } => "Network error. Please check your connection.".to_string(),
            Self::Unauthorized { .. } => "You are not authorized. Please log in again.".to_string(),
            Self::NotFound { .. } => "The requested resource was not found.".to_string(),
            Self::Decode(_) => "Unexpected response from server.".to_string(),
            Self::Status { status, message } => match status {
                400 => server(message, "Invalid request. Please check your input."),
                403 => "Access denied. You do not have permission for this action.".to_string(),
                429 => "Too many requests. Please wait a moment before trying again.".to_string(),
                500..=599 => "Server error. Please try again later.".to_string(),
                other => server(message, &format!("Request failed with status {other}")),
            },
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Unauthorized { .. } | Self::NotFound { .. } | Self::Decode(_) => false,
        }
    }
}

impl From<ParseError> for ApiError {
    fn from(err: ParseError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Store-facing failure: the structured `{success: false, message}` result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    /// User-visible text.
    pub message: String,
    /// Whether the UI should redirect to login.
    pub requires_login: bool,
}

impl StoreError {
    /// Error with a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), requires_login: false }
    }
}

/// Result of a store operation.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<ApiError> for StoreError {
    fn from(err: ApiError) -> Self {
        Self { message: err.user_message(), requires_login: err.requires_login() }
    }
}

impl From<ValidationError> for StoreError {
    fn from(err: ValidationError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<AuthError> for StoreError {
    fn from(_: AuthError) -> Self {
        Self { message: "Your session has expired. Please log in again.".to_string(), requires_login: true }
    }
}

impl From<ChannelError> for StoreError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Validation(v) => v.into(),
            ChannelError::Transport(TransportError::Auth(auth)) => auth.into(),
            ChannelError::NotConnected => {
                Self::new("Realtime connection unavailable. Please try again.")
            },
            other => Self::new(other.to_string()),
        }
    }
}
