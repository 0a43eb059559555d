//! Session client: the public face of the agent session core.
//!
//! Composes the codec, the connection manager and the step accumulator.
//! Everything the caller needs to render arrives as a [`SessionEvent`] on
//! the channel returned by [`SessionClient::new`].

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use agent_session_core::{
    AccumulatorEvent, ConnectionState, Connector, StepAccumulator, StepRecord, Trace,
    TraceDiagnostics, Turn,
};
use agent_session_transport::{
    ConnectionError, ConnectionEvent, ConnectionEventKind, ConnectionManager, EncodeError,
    InboundMessage, SendError, SendReceipt, decode, encode,
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ClientConfig;

/// What the session reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The trace of the current turn grew; carries a snapshot.
    StepAppended(Trace),
    /// The current turn finished with this output.
    TurnCompleted(String),
    /// The server reported an error for the current turn.
    TurnFailed(String),
    /// A frame violated the protocol. The session keeps going.
    ProtocolError(String),
    /// The connection moved to a new state.
    ConnectionStateChanged(ConnectionState),
    /// Informational status from the agent.
    Status(String),
}

/// Caller misuse, rejected before anything reaches the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Turn has neither content nor context")]
    EmptyTurn,
    #[error("A turn is already in flight")]
    TurnInFlight,
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Agent service is offline; turn not sent")]
    Offline,
    #[error("Session stopped")]
    Stopped,
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Bookkeeping for the most recent turn.
struct TurnInfo {
    id: Uuid,
    /// Connection the turn was sent on.
    generation: u64,
    /// Events at or below this sequence were emitted before the send.
    watermark: u64,
    sent_at: Instant,
}

impl TurnInfo {
    const fn owns(&self, event_generation: u64, event_sequence: u64) -> bool {
        self.generation == event_generation && event_sequence > self.watermark
    }
}

struct Inner {
    accumulator: StepAccumulator,
    turn: Option<TurnInfo>,
    in_flight: bool,
    stopped: bool,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Inner {
    fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            accumulator: StepAccumulator::new(),
            turn: None,
            in_flight: false,
            stopped: false,
            events: Some(events),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn handle(&mut self, event: ConnectionEvent) {
        match event.kind {
            ConnectionEventKind::StateChanged(state) => {
                if state == ConnectionState::Disconnected {
                    self.abandon_turn(event.generation);
                }
                self.emit(SessionEvent::ConnectionStateChanged(state));
            }
            ConnectionEventKind::Opened => {
                tracing::debug!(generation = event.generation, "transport open");
            }
            ConnectionEventKind::Closed(reason) => {
                tracing::debug!(generation = event.generation, reason = %reason, "transport closed");
            }
            ConnectionEventKind::Message(raw) => {
                self.on_frame(event.generation, event.sequence, &raw);
            }
        }
    }

    /// Abandon the in-flight turn if it was sent on the connection that dropped.
    fn abandon_turn(&mut self, generation: u64) {
        if !self.in_flight {
            return;
        }
        let Some(turn) = self.turn.as_ref().filter(|t| t.generation == generation) else {
            return;
        };
        tracing::warn!(
            turn_id = %turn.id,
            steps = self.accumulator.trace().len(),
            "connection lost mid-turn; turn abandoned"
        );
        self.in_flight = false;
        self.accumulator.disarm();
    }

    fn owned_by_turn(&self, generation: u64, sequence: u64) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|turn| turn.owns(generation, sequence))
    }

    fn on_frame(&mut self, generation: u64, sequence: u64, raw: &str) {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "protocol error");
                self.emit(SessionEvent::ProtocolError(e.to_string()));
                return;
            }
        };

        match message {
            InboundMessage::StepUpdate(step) => self.on_step(generation, sequence, step),
            InboundMessage::Error(detail) => {
                if self.in_flight && self.owned_by_turn(generation, sequence) {
                    self.in_flight = false;
                    self.accumulator.disarm();
                    tracing::warn!(detail = %detail, "agent reported an error");
                    self.emit(SessionEvent::TurnFailed(detail));
                } else {
                    tracing::warn!(detail = %detail, "agent error outside a turn");
                    self.emit(SessionEvent::ProtocolError(format!(
                        "agent error outside a turn: {detail}"
                    )));
                }
            }
            InboundMessage::Status(detail) => {
                tracing::info!(detail = %detail, "agent status");
                self.emit(SessionEvent::Status(detail));
            }
        }
    }

    fn on_step(&mut self, generation: u64, sequence: u64, step: StepRecord) {
        let step_number = step.step_number;
        match &self.turn {
            Some(turn) if turn.owns(generation, sequence) => {}
            Some(turn) if turn.generation == generation => {
                tracing::debug!(step_number, sequence, "dropping step queued before the turn was sent");
                return;
            }
            Some(_) => {
                tracing::debug!(step_number, generation, "dropping step from a superseded connection");
                return;
            }
            None => {
                tracing::warn!(step_number, "step received before any turn was sent");
                return;
            }
        }

        match self.accumulator.on_step(step) {
            AccumulatorEvent::Appended {
                step_number,
                sequence_gap,
            } => {
                tracing::debug!(step_number, "step appended");
                self.report_gap(sequence_gap, step_number);
                self.emit(SessionEvent::StepAppended(self.accumulator.trace().clone()));
            }
            AccumulatorEvent::Completed {
                output,
                sequence_gap,
            } => {
                self.report_gap(sequence_gap, step_number);
                self.in_flight = false;
                if let Some(turn) = &self.turn {
                    tracing::info!(
                        turn_id = %turn.id,
                        steps = self.accumulator.trace().len(),
                        elapsed_ms = u64::try_from(turn.sent_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "turn completed"
                    );
                }
                self.emit(SessionEvent::StepAppended(self.accumulator.trace().clone()));
                self.emit(SessionEvent::TurnCompleted(output));
            }
            AccumulatorEvent::AfterCompletion { step_number } => {
                tracing::warn!(step_number, "step arrived after turn completion");
                self.emit(SessionEvent::StepAppended(self.accumulator.trace().clone()));
                self.emit(SessionEvent::ProtocolError(format!(
                    "step {step_number} arrived after turn completion"
                )));
            }
            AccumulatorEvent::Stale { step_number } => {
                tracing::debug!(step_number, "dropping step for a finished turn");
            }
        }
    }

    fn report_gap(&self, sequence_gap: bool, step_number: u64) {
        if sequence_gap {
            self.emit(SessionEvent::ProtocolError(format!(
                "step {step_number} arrived out of sequence"
            )));
        }
    }
}

/// State shared by every clone of a [`SessionClient`]. The background
/// tasks only hold the connection internals and `inner`, so dropping the
/// last clone tears the session down.
struct Session {
    connection: ConnectionManager,
    inner: Arc<Mutex<Inner>>,
}

impl Session {
    fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        if !inner.stopped {
            inner.stopped = true;
            inner.in_flight = false;
            inner.accumulator.disarm();
            inner.events = None;
        }
        drop(inner);
        self.connection.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Real-time client for a remote agent.
///
/// Cheap to clone; clones share the same session. The session stops on
/// [`stop`](Self::stop) or when the last clone is dropped.
#[derive(Clone)]
pub struct SessionClient {
    session: Arc<Session>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("connection", &self.session.connection)
            .field("turn_in_flight", &self.turn_in_flight())
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    /// Create a client over an arbitrary connector.
    ///
    /// Returns the client and the receiver of its events.
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            connector,
            config.backoff.clone(),
            config.connect_timeout,
        );
        let client = Self {
            session: Arc::new(Session {
                connection,
                inner: Arc::new(Mutex::new(Inner::new(tx))),
            }),
        };
        (client, rx)
    }

    /// Create a client talking WebSocket to `config.url`.
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn websocket(config: &ClientConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let connector = agent_session_transport::WebSocketConnector::new(config.url.clone());
        Self::new(config, Arc::new(connector))
    }

    /// Start connecting. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns error if already started or stopped.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.lock().stopped {
            return Err(SessionError::Stopped);
        }
        let events = self.session.connection.start()?;
        tokio::spawn(pump(Arc::clone(&self.session.inner), events));
        Ok(())
    }

    /// Send a user turn.
    ///
    /// Completion is reported through [`SessionEvent`]s, never by this call.
    ///
    /// # Errors
    /// - `ValidationError::EmptyTurn` if there is nothing to send
    /// - `ValidationError::TurnInFlight` if the previous turn has not finished
    /// - `SessionError::Offline` if the connection is not up; the turn is not queued
    pub fn send_turn(&self, turn: &Turn) -> Result<(), SessionError> {
        if turn.is_empty() {
            return Err(ValidationError::EmptyTurn.into());
        }

        let mut inner = self.lock();
        if inner.stopped {
            return Err(SessionError::Stopped);
        }
        if inner.in_flight {
            return Err(ValidationError::TurnInFlight.into());
        }

        inner.accumulator.reset();
        let frame = match encode(turn) {
            Ok(frame) => frame,
            Err(e) => {
                inner.accumulator.disarm();
                return Err(e.into());
            }
        };

        match self.session.connection.send_tagged(frame) {
            Ok(SendReceipt {
                generation,
                watermark,
            }) => {
                let id = Uuid::new_v4();
                tracing::info!(turn_id = %id, generation, has_context = turn.context.is_some(), "turn sent");
                inner.turn = Some(TurnInfo {
                    id,
                    generation,
                    watermark,
                    sent_at: Instant::now(),
                });
                inner.in_flight = true;
                Ok(())
            }
            Err(e @ (SendError::NotConnected | SendError::TransportClosed)) => {
                inner.accumulator.disarm();
                tracing::warn!(error = %e, "turn rejected: agent service offline");
                Err(SessionError::Offline)
            }
        }
    }

    /// Tear the session down. Idempotent; no event is emitted afterwards.
    pub fn stop(&self) {
        self.session.shutdown();
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session.connection.state()
    }

    /// Snapshot of the current trace.
    #[must_use]
    pub fn trace(&self) -> Trace {
        self.lock().accumulator.trace().clone()
    }

    /// True while a sent turn has neither completed nor failed.
    #[must_use]
    pub fn turn_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Protocol anomalies seen during the current turn.
    #[must_use]
    pub fn diagnostics(&self) -> TraceDiagnostics {
        self.lock().accumulator.diagnostics()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.session.inner)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pump(inner: Arc<Mutex<Inner>>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let mut guard = lock(&inner);
        if guard.stopped {
            break;
        }
        guard.handle(event);
    }
    tracing::debug!("session event pump finished");
}
