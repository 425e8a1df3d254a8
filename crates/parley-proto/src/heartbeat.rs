//! Heart-beat negotiation.
//!
//! Each side advertises `cx,cy` in milliseconds: `cx` is the smallest interval
//! at which it can send, `cy` the interval at which it wants to receive. Zero
//! means "cannot" / "does not want". The effective interval in each direction
//! is the larger of the two relevant values, or none when either is zero.

use std::time::Duration;

use crate::errors::{FrameError, Result};

/// Advertised heart-beat capability (`heart-beat` header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    /// How often this side can send.
    pub outgoing: Duration,
    /// How often this side wants to hear from the peer.
    pub incoming: Duration,
}

/// Negotiated intervals from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// Client must send something at least this often.
    pub send_every: Option<Duration>,
    /// Server promises to send something at least this often.
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    /// 4000ms each way.
    pub const DEFAULT: Self = Self::symmetric(Duration::from_millis(4000));

    /// Heart-beats disabled in both directions.
    pub const DISABLED: Self = Self::symmetric(Duration::ZERO);

    /// Same interval in both directions.
    pub const fn symmetric(interval: Duration) -> Self {
        Self { outgoing: interval, incoming: interval }
    }

    /// Parse a `cx,cy` header value.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || FrameError::InvalidHeartBeat { value: value.to_string() };

        let (cx, cy) = value.split_once(',').ok_or_else(invalid)?;
        let cx: u64 = cx.trim().parse().map_err(|_| invalid())?;
        let cy: u64 = cy.trim().parse().map_err(|_| invalid())?;

        Ok(Self { outgoing: Duration::from_millis(cx), incoming: Duration::from_millis(cy) })
    }

    /// Header value for this capability.
    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }

    /// Combine the client's advertisement (`self`) with the server's.
    pub fn negotiate(&self, server: &Self) -> Negotiated {
        Negotiated {
            send_every: effective(self.outgoing, server.incoming),
            expect_every: effective(server.outgoing, self.incoming),
        }
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn effective(sender: Duration, receiver: Duration) -> Option<Duration> {
    if sender.is_zero() || receiver.is_zero() { None } else { Some(sender.max(receiver)) }
}
