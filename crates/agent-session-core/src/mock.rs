//! In-memory connector for tests and local development.
//!
//! Every successful `connect` hands the far end of the new connection to
//! the test through a channel, so the test can play the server.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionPeer, Connector, TransportError};

/// Connector spy that records attempts and can be told to refuse.
#[derive(Debug)]
pub struct MockConnector {
    attempts: AtomicUsize,
    refuse_next: AtomicUsize,
    peers: mpsc::UnboundedSender<ConnectionPeer>,
}

impl MockConnector {
    /// Create a connector and the receiver of server-side peers.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            attempts: AtomicUsize::new(0),
            refuse_next: AtomicUsize::new(0),
            peers,
        };
        (connector, peers_rx)
    }

    /// Make the next `n` attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("mock connection refused".into()));
        }

        let (conn, peer) = Connection::pair();
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("mock peer receiver dropped".into()))?;
        Ok(conn)
    }

    fn endpoint(&self) -> String {
        "mock://agent".to_string()
    }
}
