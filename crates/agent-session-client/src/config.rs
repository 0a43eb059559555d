//! Client configuration.
//!
//! Settings come from the environment, from a JSON document, or from the
//! builder. Durations are expressed in milliseconds on the outside.

use std::time::Duration;

use agent_session_transport::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default agent service address.
pub const DEFAULT_BASE_URL: &str = "ws://localhost:8000";
/// Path of the agent WebSocket endpoint.
pub const DEFAULT_WS_PATH: &str = "/api/agent/ws";
/// Default reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_MS: u64 = 3_000;

pub const ENV_URL: &str = "AGENT_WS_URL";
pub const ENV_PATH: &str = "AGENT_WS_PATH";
pub const ENV_RECONNECT_MS: &str = "AGENT_RECONNECT_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "AGENT_RECONNECT_MAX_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "AGENT_CONNECT_TIMEOUT_MS";

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Agent URL is empty")]
    EmptyUrl,
    #[error("Unsupported URL scheme (expected ws:// or wss://): {0}")]
    UnsupportedScheme(String),
    #[error("Reconnect delay must be greater than zero")]
    ZeroReconnectDelay,
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: String, value: String },
}

/// Validated client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Full WebSocket URL of the agent endpoint.
    pub url: String,
    /// Delay policy between reconnect attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: join_url(DEFAULT_BASE_URL, DEFAULT_WS_PATH),
            backoff: BackoffPolicy::default(),
            connect_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Start a new builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Load from `AGENT_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = ClientSettings::default();
        if let Some(url) = lookup(ENV_URL) {
            settings.base_url = url;
        }
        if let Some(path) = lookup(ENV_PATH) {
            settings.path = path;
        }
        if let Some(ms) = parse_ms(&lookup, ENV_RECONNECT_MS)? {
            settings.reconnect_ms = ms;
        }
        settings.reconnect_max_ms = parse_ms(&lookup, ENV_RECONNECT_MAX_MS)?;
        settings.connect_timeout_ms = parse_ms(&lookup, ENV_CONNECT_TIMEOUT_MS)?;
        settings.into_config()
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns error for an empty or non-WebSocket URL, or a zero reconnect delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::UnsupportedScheme(url.to_string()));
        }
        if self.backoff.initial_delay.is_zero() {
            return Err(ConfigError::ZeroReconnectDelay);
        }
        Ok(())
    }
}

/// Serializable settings, the external form of [`ClientConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub path: String,
    pub reconnect_ms: u64,
    /// When greater than `reconnect_ms`, backoff doubles up to this cap.
    pub reconnect_max_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            reconnect_ms: DEFAULT_RECONNECT_MS,
            reconnect_max_ms: None,
            connect_timeout_ms: None,
        }
    }
}

impl ClientSettings {
    /// Convert into a validated [`ClientConfig`].
    ///
    /// # Errors
    /// Returns error if the resulting configuration is invalid.
    pub fn into_config(self) -> Result<ClientConfig, ConfigError> {
        let initial = Duration::from_millis(self.reconnect_ms);
        let backoff = match self.reconnect_max_ms {
            Some(max) if max > self.reconnect_ms => {
                BackoffPolicy::exponential(initial, Duration::from_millis(max))
            }
            _ => BackoffPolicy::constant(initial),
        };

        let config = ClientConfig {
            url: join_url(&self.base_url, &self.path),
            backoff,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fluent builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the full endpoint URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the endpoint from a base URL and the default agent path.
    #[must_use]
    pub fn base_url(mut self, base: &str) -> Self {
        self.config.url = join_url(base, DEFAULT_WS_PATH);
        self
    }

    /// Override the reconnect policy.
    #[must_use]
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Bound each connection attempt.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Build and validate.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Join a base URL and an endpoint path with exactly one slash.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

fn parse_ms<F>(lookup: &F, var: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: var.to_string(),
                    value,
                })
        })
        .transpose()
}
