//! Transport layer for agent session clients.
//!
//! Provides:
//! - Wire protocol codec (JSON frames discriminated by `type`)
//! - Reconnect backoff policy
//! - `ConnectionManager` - one logical connection, reconnected forever
//! - WebSocket connector (feature: websocket)

pub mod backoff;
pub mod connection;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::BackoffPolicy;
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionEventKind, ConnectionManager, SendError,
    SendReceipt,
};
pub use protocol::{DecodeError, EncodeError, InboundMessage, decode, decode_turn, encode};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
