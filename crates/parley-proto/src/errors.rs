//! Error types for frame decoding and payload parsing.

use thiserror::Error;

/// Result alias for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;

/// STOMP framing errors.
///
/// Raised by [`crate::Frame::decode`] when the bytes received on a socket do
/// not form a well-formed STOMP 1.2 frame. None of these are recoverable for
/// the frame in question; the transport logs and drops it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input was empty.
    #[error("empty frame")]
    Empty,

    /// Command line is not a STOMP command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Headers were not terminated by a blank line.
    #[error("frame headers not terminated")]
    UnterminatedHeaders,

    /// A header line has no `:` separator.
    #[error("malformed header line: {line}")]
    MalformedHeader {
        /// The offending line (unescaped form is unavailable).
        line: String,
    },

    /// A header uses an escape sequence STOMP 1.2 does not define.
    #[error("invalid header escape: \\{sequence}")]
    InvalidEscape {
        /// Character following the backslash (empty at end of input).
        sequence: String,
    },

    /// Frame text is not UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Body did not end with a NUL octet.
    #[error("missing NUL terminator")]
    MissingTerminator,

    /// `content-length` header could not be parsed.
    #[error("invalid content-length: {value}")]
    InvalidContentLength {
        /// Raw header value.
        value: String,
    },

    /// `content-length` claims more bytes than were received.
    #[error("content-length {declared} exceeds available {available} bytes")]
    ContentLengthMismatch {
        /// Declared body length.
        declared: usize,
        /// Bytes actually present after the headers.
        available: usize,
    },

    /// Heart-beat header value is not `cx,cy`.
    #[error("invalid heart-beat header: {value}")]
    InvalidHeartBeat {
        /// Raw header value.
        value: String,
    },
}

/// Errors at the payload validation boundary.
///
/// Every inbound JSON payload passes through a parse function that yields a
/// typed domain value or one of these. Raw JSON never crosses into the stores.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Body was not valid JSON or did not match the payload shape.
    #[error("invalid payload json: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was absent, null or empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field was present with an unusable value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name as it appears on the wire.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl ParseError {
    /// Whether the payload was well-formed JSON but semantically incomplete.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingField(_) | Self::InvalidField { .. })
    }
}
