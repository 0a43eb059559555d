//! Real-time agent session client.
//!
//! Provides:
//! - `SessionClient` - Send turns, receive ordered step traces and results
//! - `ClientConfig` - Endpoint, reconnect policy and timeouts

pub mod client;
pub mod config;

pub use agent_session_core::{ConnectionState, StepRecord, ToolCall, Trace, Turn, TurnContext};
pub use agent_session_transport::BackoffPolicy;
pub use client::{SessionClient, SessionError, SessionEvent, ValidationError};
pub use config::{ClientConfig, ClientConfigBuilder, ClientSettings, ConfigError};
