//! Socket plumbing between the transport state machine and the network.
//!
//! The transport only emits [`TransportAction`]s. A [`SocketConnector`] turns
//! `OpenSocket` into a running connection whose lifecycle comes back as
//! [`SocketEvent`]s on one channel shared by every socket; writes go through
//! the returned [`SocketLink`].
//!
//! [`TransportAction`]: parley_core::TransportAction

use parley_core::SocketId;
use tokio::sync::mpsc;

/// Something a socket reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket is open.
    Opened(SocketId),
    /// Bytes arrived.
    Data(SocketId, Vec<u8>),
    /// The socket closed or failed to open.
    Closed(SocketId, String),
}

impl SocketEvent {
    /// Socket the event belongs to.
    pub fn socket(&self) -> SocketId {
        match self {
            Self::Opened(socket) | Self::Data(socket, _) | Self::Closed(socket, _) => *socket,
        }
    }
}

/// Write-side command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write bytes as one text message.
    Data(Vec<u8>),
    /// Close the socket.
    Close,
}

/// Write half of an open socket.
#[derive(Debug, Clone)]
pub struct SocketLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketLink {
    /// Link writing into `tx`.
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Link plus the receiving end, for connectors and tests.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue bytes. Returns `false` if the socket task is gone.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.tx.send(Outbound::Data(data)).is_ok()
    }

    /// Ask the socket to close.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Opens sockets.
///
/// Implementations must eventually report exactly one of `Opened` or
/// `Closed` for `socket`, and `Closed` once after an `Opened`.
pub trait SocketConnector: Send + 'static {
    /// Start connecting `socket` to `endpoint`.
    fn open(
        &mut self,
        socket: SocketId,
        endpoint: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketLink;
}

#[cfg(feature = "transport")]
pub use ws::WsConnector;

#[cfg(feature = "transport")]
mod ws {
    use futures_util::{SinkExt, StreamExt};
    use parley_core::SocketId;
    use tokio::sync::mpsc;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    use super::{Outbound, SocketConnector, SocketEvent, SocketLink};

    /// WebSocket connector over tokio-tungstenite. Each socket runs on its
    /// own task.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WsConnector;

    impl WsConnector {
        /// New connector.
        pub fn new() -> Self {
            Self
        }
    }

    impl SocketConnector for WsConnector {
        fn open(
            &mut self,
            socket: SocketId,
            endpoint: &str,
            events: mpsc::UnboundedSender<SocketEvent>,
        ) -> SocketLink {
            let (link, outbound) = SocketLink::pair();
            tokio::spawn(run(socket, endpoint.to_string(), events, outbound));
            link
        }
    }

    async fn run(
        socket: SocketId,
        endpoint: String,
        events: mpsc::UnboundedSender<SocketEvent>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        tracing::debug!(socket = socket.get(), %endpoint, "opening websocket");
        let stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(socket = socket.get(), error = %err, "websocket connect failed");
                let _ = events.send(SocketEvent::Closed(socket, err.to_string()));
                return;
            },
        };
        let _ = events.send(SocketEvent::Opened(socket));
        let (mut write, mut read) = stream.split();

        let reason = loop {
            tokio::select! {
                command = outbound.recv() => match command {
                    Some(Outbound::Data(data)) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if let Err(err) = write.send(Message::Text(text.into())).await {
                            break err.to_string();
                        }
                    },
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break "closed by client".to_string();
                    },
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(SocketEvent::Data(socket, text.as_bytes().to_vec()));
                    },
                    Some(Ok(Message::Binary(data))) => {
                        let _ = events.send(SocketEvent::Data(socket, data.to_vec()));
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {} {}", f.code, f.reason),
                        );
                    },
                    Some(Ok(_)) => {},
                    Some(Err(err)) => break err.to_string(),
                    None => break "stream ended".to_string(),
                },
            }
        };

        tracing::debug!(socket = socket.get(), %reason, "websocket closed");
        let _ = events.send(SocketEvent::Closed(socket, reason));
    }
}
