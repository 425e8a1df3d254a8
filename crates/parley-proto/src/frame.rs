//! STOMP 1.2 frames.
//!
//! A frame on the wire is:
//!
//! ```text
//! COMMAND EOL
//! *( header-name ":" header-value EOL )
//! EOL
//! *OCTET NUL
//! ```
//!
//! A message consisting only of EOLs is a heart-beat. Over a WebSocket each
//! text message carries exactly one frame or one heart-beat, so decoding works
//! on a complete message rather than a byte stream.

use std::{fmt, str::FromStr};

use bytes::Bytes;

use crate::errors::{FrameError, Result};

/// Bytes sent as an outgoing heart-beat.
pub const HEARTBEAT: &[u8] = b"\n";

/// STOMP frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client connect request.
    Connect,
    /// Client connect request (STOMP 1.2 alias).
    Stomp,
    /// Server accepted the connection.
    Connected,
    /// Publish to a destination.
    Send,
    /// Subscribe to a destination.
    Subscribe,
    /// Cancel a subscription.
    Unsubscribe,
    /// Acknowledge a message.
    Ack,
    /// Reject a message.
    Nack,
    /// Begin a transaction.
    Begin,
    /// Commit a transaction.
    Commit,
    /// Abort a transaction.
    Abort,
    /// Graceful disconnect.
    Disconnect,
    /// Server delivery on a subscription.
    Message,
    /// Server receipt.
    Receipt,
    /// Server error. The server closes the connection after sending it.
    Error,
}

impl Command {
    /// Every command, in protocol order.
    pub const ALL: [Self; 15] = [
        Self::Connect,
        Self::Stomp,
        Self::Connected,
        Self::Send,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Ack,
        Self::Nack,
        Self::Begin,
        Self::Commit,
        Self::Abort,
        Self::Disconnect,
        Self::Message,
        Self::Receipt,
        Self::Error,
    ];

    /// Command as written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent raw for 1.0 compatibility.
    pub fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| FrameError::UnknownCommand(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding one WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keep-alive with no content.
    Heartbeat,
    /// A complete frame.
    Frame(Frame),
}

/// A STOMP frame.
///
/// Headers keep their wire order. When a header name repeats, the first
/// occurrence is authoritative (STOMP 1.2 §"Repeated Header Entries"), which
/// [`Frame::get`] honours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order, unescaped.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: Bytes::new() }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of the named header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Serialize to wire bytes.
    ///
    /// A `content-length` header is added for non-empty bodies unless the
    /// caller already set one, so bodies containing NUL survive the trip.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');

        let escape_headers = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if escape_headers {
                out.extend_from_slice(escape(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decode one WebSocket message.
    ///
    /// Leading EOLs are heart-beats that arrived glued to the frame and are
    /// skipped. Anything after the terminating NUL is ignored.
    pub fn decode(data: &[u8]) -> Result<Inbound> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }

        let Some(start) = data.iter().position(|b| *b != b'\n' && *b != b'\r') else {
            return Ok(Inbound::Heartbeat);
        };
        let data = &data[start..];

        let (command_line, mut pos) = read_line(data, 0)?;
        let command: Command = command_line.parse()?;
        let unescape_headers = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, next) = read_line(data, pos)?;
            pos = next;
            if line.is_empty() {
                break;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(FrameError::MalformedHeader { line: line.to_string() });
            };

            if unescape_headers {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &data[pos..];
        let content_length = headers.iter().find(|(k, _)| k == "content-length").map(|(_, v)| v);

        let body = match content_length {
            Some(raw) => {
                let declared: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength { value: raw.clone() })?;

                if rest.len() < declared {
                    return Err(FrameError::ContentLengthMismatch {
                        declared,
                        available: rest.len(),
                    });
                }
                if rest.get(declared) != Some(&0) {
                    return Err(FrameError::MissingTerminator);
                }
                &rest[..declared]
            },
            None => {
                let end = rest.iter().position(|b| *b == 0).ok_or(FrameError::MissingTerminator)?;
                &rest[..end]
            },
        };

        Ok(Inbound::Frame(Frame { command, headers, body: Bytes::copy_from_slice(body) }))
    }
}

/// Read one line starting at `pos`, tolerating `\r\n` line endings.
fn read_line(data: &[u8], pos: usize) -> Result<(&str, usize)> {
    let rest = data.get(pos..).ok_or(FrameError::UnterminatedHeaders)?;
    let len = rest.iter().position(|b| *b == b'\n').ok_or(FrameError::UnterminatedHeaders)?;

    let mut line = &rest[..len];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    Ok((line, pos + len + 1))
}

/// Escape a header name or value.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`]. Undefined escape sequences are a fatal error.
pub fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(FrameError::InvalidEscape {
                    sequence: other.map(String::from).unwrap_or_default(),
                });
            },
        }
    }
    Ok(out)
}
