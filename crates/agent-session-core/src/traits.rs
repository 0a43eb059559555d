//! Connection state and the transport seam.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No usable transport. A reconnect may be scheduled.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The transport is open and frames can be sent.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Something the transport reports after it is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),
    /// The transport dropped. No further events follow.
    Closed(String),
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open transport, seen from the client side.
///
/// Frames written to `outbound` go to the server; everything the server
/// sends, and the final close, arrives on `inbound`. Dropping the
/// connection releases the transport.
#[derive(Debug)]
pub struct Connection {
    /// Sender for outbound text frames.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Receiver for inbound frames and the close notification.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Create a connection plus the peer end that drives it.
    ///
    /// Transports bridge their socket to the peer; tests hold the peer
    /// directly to play the server.
    #[must_use]
    pub fn pair() -> (Self, ConnectionPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let conn = Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };

        let peer = ConnectionPeer {
            sent: outbound_rx,
            events: inbound_tx,
        };

        (conn, peer)
    }
}

/// Far end of a [`Connection`].
#[derive(Debug)]
pub struct ConnectionPeer {
    /// Frames the client sent.
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Sender for events delivered to the client.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionPeer {
    /// Deliver one inbound frame. Returns false if the client side is gone.
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Frame(frame.into())).is_ok()
    }

    /// Report the transport as closed.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Closed(reason.into()));
    }

    /// Wait for the next frame the client sent.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Non-blocking variant of [`next_sent`](Self::next_sent).
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }
}

/// Opens transports for the connection manager.
///
/// Every call must produce a fresh, independent transport instance.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport.
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Human-readable target, used in logs.
    fn endpoint(&self) -> String {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut conn, mut peer) = Connection::pair();

        conn.outbound.send("hello".into()).unwrap();
        assert_eq!(peer.next_sent().await.as_deref(), Some("hello"));

        assert!(peer.push_frame("{\"type\":\"status\"}"));
        peer.close("bye");
        assert_eq!(
            conn.inbound.recv().await,
            Some(TransportEvent::Frame("{\"type\":\"status\"}".into()))
        );
        assert_eq!(
            conn.inbound.recv().await,
            Some(TransportEvent::Closed("bye".into()))
        );
    }
}
