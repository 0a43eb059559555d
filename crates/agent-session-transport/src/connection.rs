//! Connection manager: one logical connection, reconnected until stopped.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected --close/error--> Disconnected
//! ```
//!
//! Every connection attempt gets a new generation number. Events are only
//! emitted for the current generation, and the check happens under the
//! same lock `stop()` takes, so a superseded attempt or a stopped manager
//! can never reach the consumer.
//!
//! Emitted events also carry a manager-wide sequence number. A send returns
//! the sequence of the last event emitted before it, so the consumer can
//! tell frames queued before the send from frames that came after.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use agent_session_core::{Connection, ConnectionState, Connector, TransportError, TransportEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;

/// Event emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Attempt generation the event belongs to.
    pub generation: u64,
    /// Position in the manager's event stream, starting at 1.
    pub sequence: u64,
    pub kind: ConnectionEventKind,
}

/// Where a sent frame sits relative to the inbound event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Generation of the connection the frame was handed to.
    pub generation: u64,
    /// Sequence of the last event emitted before the send. Every event
    /// with a higher sequence was emitted after it.
    pub watermark: u64,
}

/// What happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// The manager moved to a new state.
    StateChanged(ConnectionState),
    /// The transport became usable.
    Opened,
    /// One inbound frame.
    Message(String),
    /// The transport dropped or the attempt failed.
    Closed(String),
}

/// Send error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport closed")]
    TransportClosed,
}

/// Connection manager lifecycle error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection manager already started")]
    AlreadyStarted,
    #[error("Connection manager stopped")]
    Stopped,
    #[error("No tokio runtime available")]
    NoRuntime,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    sequence: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    started: bool,
    stopped: bool,
}

impl Inner {
    fn emit(&mut self, generation: u64, kind: ConnectionEventKind) -> bool {
        if self.stopped || self.generation != generation {
            return false;
        }
        if let Some(tx) = &self.events {
            self.sequence += 1;
            let _ = tx.send(ConnectionEvent {
                generation,
                sequence: self.sequence,
                kind,
            });
        }
        true
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    connect_timeout: Option<Duration>,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

/// Owns the transport and hides transient failures behind reconnects.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.shared.connector.endpoint())
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("stopped", &inner.stopped)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager. Nothing happens until [`start`](Self::start).
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: BackoffPolicy,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                policy,
                connect_timeout,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    sequence: 0,
                    outbound: None,
                    events: None,
                    started: false,
                    stopped: false,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Begin connecting on the current tokio runtime.
    ///
    /// Returns the event stream for this manager. It ends when the manager
    /// is stopped.
    ///
    /// # Errors
    /// Returns error if already started, already stopped, or called
    /// outside a tokio runtime.
    pub fn start(&self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let mut inner = self.shared.lock();
        if inner.stopped {
            return Err(ConnectionError::Stopped);
        }
        if inner.started {
            return Err(ConnectionError::AlreadyStarted);
        }
        inner.started = true;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);
        drop(inner);

        tracing::info!(endpoint = %self.shared.connector.endpoint(), "starting connection manager");
        handle.spawn(supervise(Arc::clone(&self.shared)));
        Ok(rx)
    }

    /// Send one raw frame. Never waits.
    ///
    /// # Errors
    /// Returns `SendError::NotConnected` unless the state is `Connected`.
    pub fn send(&self, raw: String) -> Result<(), SendError> {
        self.send_tagged(raw).map(|_| ())
    }

    /// Like [`send`](Self::send), returning where the frame sits relative
    /// to the inbound event stream.
    ///
    /// # Errors
    /// Returns `SendError::NotConnected` unless the state is `Connected`.
    pub fn send_tagged(&self, raw: String) -> Result<SendReceipt, SendError> {
        let inner = self.shared.lock();
        if inner.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        let tx = inner.outbound.as_ref().ok_or(SendError::NotConnected)?;
        tx.send(raw).map_err(|_| SendError::TransportClosed)?;
        Ok(SendReceipt {
            generation: inner.generation,
            watermark: inner.sequence,
        })
    }

    /// Release the transport and stop reconnecting.
    ///
    /// Idempotent, and safe to call before `start`. No event is emitted
    /// after this returns.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        inner.generation += 1;
        inner.state = ConnectionState::Disconnected;
        inner.outbound = None;
        inner.events = None;
        drop(inner);

        self.shared.cancel.cancel();
        tracing::info!(endpoint = %self.shared.connector.endpoint(), "connection manager stopped");
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Generation of the current (or most recent) attempt.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// True if events of `generation` are still live.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.shared.lock();
        !inner.stopped && inner.generation == generation
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new attempt. Returns its generation, or `None` once stopped.
    fn begin_attempt(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.stopped {
            return None;
        }
        inner.generation += 1;
        inner.state = ConnectionState::Connecting;
        let generation = inner.generation;
        inner.emit(
            generation,
            ConnectionEventKind::StateChanged(ConnectionState::Connecting),
        );
        Some(generation)
    }

    fn mark_connected(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut inner = self.lock();
        if inner.stopped || inner.generation != generation {
            return false;
        }
        inner.state = ConnectionState::Connected;
        inner.outbound = Some(outbound);
        inner.emit(
            generation,
            ConnectionEventKind::StateChanged(ConnectionState::Connected),
        );
        inner.emit(generation, ConnectionEventKind::Opened)
    }

    fn mark_disconnected(&self, generation: u64, reason: String) -> bool {
        let mut inner = self.lock();
        if inner.stopped || inner.generation != generation {
            return false;
        }
        inner.state = ConnectionState::Disconnected;
        inner.outbound = None;
        inner.emit(
            generation,
            ConnectionEventKind::StateChanged(ConnectionState::Disconnected),
        );
        inner.emit(generation, ConnectionEventKind::Closed(reason))
    }

    fn emit(&self, generation: u64, kind: ConnectionEventKind) -> bool {
        self.lock().emit(generation, kind)
    }

    async fn open(&self) -> Result<Connection, TransportError> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.connector.connect())
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => self.connector.connect().await,
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let endpoint = shared.connector.endpoint();
    let mut attempt: u32 = 0;

    loop {
        let Some(generation) = shared.begin_attempt() else {
            return;
        };
        tracing::info!(endpoint = %endpoint, generation, "connecting");

        let result = tokio::select! {
            r = shared.open() => r,
            () = shared.cancel.cancelled() => return,
        };

        let reason = match result {
            Ok(Connection {
                outbound,
                mut inbound,
            }) => {
                if !shared.mark_connected(generation, outbound) {
                    return;
                }
                tracing::info!(endpoint = %endpoint, generation, "connected");
                attempt = 0;

                loop {
                    let event = tokio::select! {
                        ev = inbound.recv() => ev,
                        () = shared.cancel.cancelled() => return,
                    };
                    match event {
                        Some(TransportEvent::Frame(frame)) => {
                            tracing::debug!(generation, bytes = frame.len(), "inbound frame");
                            if !shared.emit(generation, ConnectionEventKind::Message(frame)) {
                                return;
                            }
                        }
                        Some(TransportEvent::Closed(reason)) => break reason,
                        None => break "transport dropped".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        tracing::warn!(endpoint = %endpoint, generation, reason = %reason, "connection lost");
        if !shared.mark_disconnected(generation, reason) {
            return;
        }

        let delay = shared.policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tracing::info!(
            endpoint = %endpoint,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "reconnecting"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_session_core::MockConnector;
    use async_trait::async_trait;

    use super::*;

    fn manager(connector: &Arc<MockConnector>) -> ConnectionManager {
        let connector: Arc<dyn Connector> = connector.clone();
        ConnectionManager::new(connector, BackoffPolicy::default(), None)
    }

    async fn next_kind(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEventKind {
        events.recv().await.expect("event stream ended").kind
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_and_reconnect_window() {
        let (connector, mut peers) = MockConnector::new();
        let connector = Arc::new(connector);
        let mgr = manager(&connector);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        let mut events = mgr.start().unwrap();
        let peer = peers.recv().await.unwrap();

        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::StateChanged(ConnectionState::Connected)
        );
        assert_eq!(next_kind(&mut events).await, ConnectionEventKind::Opened);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        peer.close("server went away");
        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::StateChanged(ConnectionState::Disconnected)
        );
        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::Closed("server went away".into())
        );
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 1);

        // Not before the backoff window...
        tokio::time::advance(Duration::from_millis(2_900)).await;
        tokio::task::yield_now().await;
        assert_eq!(connector.attempts(), 1);

        // ...but right after it.
        tokio::time::advance(Duration::from_millis(200)).await;
        let _peer = peers.recv().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        let event = events.recv().await.unwrap();
        assert_eq!(event.generation, 2);
        assert_eq!(
            event.kind,
            ConnectionEventKind::StateChanged(ConnectionState::Connecting)
        );
        assert!(!mgr.is_current(1));

        mgr.stop();
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (connector, mut peers) = MockConnector::new();
        let connector = Arc::new(connector);
        let mgr = manager(&connector);

        assert_eq!(mgr.send("early".into()), Err(SendError::NotConnected));

        let mut events = mgr.start().unwrap();
        let mut peer = peers.recv().await.unwrap();
        while next_kind(&mut events).await != ConnectionEventKind::Opened {}

        // Connecting, Connected and Opened went out before the send.
        assert_eq!(
            mgr.send_tagged("{\"content\":\"hi\"}".into()),
            Ok(SendReceipt {
                generation: 1,
                watermark: 3
            })
        );
        assert_eq!(peer.next_sent().await.as_deref(), Some("{\"content\":\"hi\"}"));

        assert!(peer.push_frame("{\"type\":\"status\",\"detail\":\"ok\"}"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.sequence, 4);
        assert_eq!(
            event.kind,
            ConnectionEventKind::Message("{\"type\":\"status\",\"detail\":\"ok\"}".into())
        );

        mgr.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_final_and_idempotent() {
        let (connector, mut peers) = MockConnector::new();
        let connector = Arc::new(connector);
        let mgr = manager(&connector);

        let mut events = mgr.start().unwrap();
        let peer = peers.recv().await.unwrap();
        while next_kind(&mut events).await != ConnectionEventKind::Opened {}

        mgr.stop();
        mgr.stop();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.is_stopped());
        assert_eq!(mgr.send("late".into()), Err(SendError::NotConnected));

        peer.push_frame("{\"type\":\"status\"}");
        peer.close("gone");
        assert!(events.recv().await.is_none());

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(mgr.start().err(), Some(ConnectionError::Stopped));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (connector, _peers) = MockConnector::new();
        let connector = Arc::new(connector);
        let mgr = manager(&connector);

        mgr.stop();
        mgr.stop();
        assert_eq!(mgr.start().err(), Some(ConnectionError::Stopped));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (connector, _peers) = MockConnector::new();
        let mgr = manager(&Arc::new(connector));
        let _events = mgr.start().unwrap();
        assert_eq!(mgr.start().err(), Some(ConnectionError::AlreadyStarted));
        mgr.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_are_retried_forever() {
        let (connector, mut peers) = MockConnector::new();
        let connector = Arc::new(connector);
        connector.refuse_next(5);
        let mgr = manager(&connector);

        let mut events = mgr.start().unwrap();
        let _peer = peers.recv().await.unwrap();
        assert_eq!(connector.attempts(), 6);

        let mut closed = 0;
        loop {
            match next_kind(&mut events).await {
                ConnectionEventKind::Closed(reason) => {
                    assert!(reason.contains("refused"));
                    closed += 1;
                }
                ConnectionEventKind::Opened => break,
                _ => {}
            }
        }
        assert_eq!(closed, 5);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        mgr.stop();
    }

    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> Result<Connection, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let mgr = ConnectionManager::new(
            Arc::new(HangingConnector),
            BackoffPolicy::default(),
            Some(Duration::from_secs(5)),
        );
        let mut events = mgr.start().unwrap();

        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_kind(&mut events).await,
            ConnectionEventKind::StateChanged(ConnectionState::Disconnected)
        );
        let ConnectionEventKind::Closed(reason) = next_kind(&mut events).await else {
            panic!("expected close");
        };
        assert!(reason.contains("timed out"));
        mgr.stop();
    }
}
