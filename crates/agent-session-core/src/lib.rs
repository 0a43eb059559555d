//! Core abstractions for real-time agent session clients.
//!
//! This crate provides the fundamental building blocks:
//! - `Turn` / `TurnContext` - One user request and its structured payload
//! - `StepRecord` / `Trace` - Agent work reported by the server
//! - `StepAccumulator` - Ordered, append-only trace for the in-flight turn
//! - `Connector` - Transport seam used by the connection manager
//! - `MockConnector` - In-memory connector for tests

pub mod accumulator;
pub mod context;
pub mod mock;
pub mod step;
pub mod traits;
pub mod turn;

pub use accumulator::{AccumulatorEvent, StepAccumulator, TraceDiagnostics};
pub use context::TurnContext;
pub use mock::MockConnector;
pub use step::{StepRecord, ToolCall, Trace};
pub use traits::{
    Connection, ConnectionPeer, ConnectionState, Connector, TransportError, TransportEvent,
};
pub use turn::Turn;
