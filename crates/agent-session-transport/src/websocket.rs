//! WebSocket transport for agent sessions.

use agent_session_core::{Connection, ConnectionPeer, Connector, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// Opens a fresh WebSocket per connection attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (conn, peer) = Connection::pair();
        let ConnectionPeer { mut sent, events } = peer;

        // Writer task: ends when the client drops its outbound sender.
        tokio::spawn(async move {
            while let Some(frame) = sent.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: forwards frames until the socket closes.
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events.send(TransportEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => tracing::warn!("dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server ({}): {}", u16::from(f.code), f.reason),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events.send(TransportEvent::Closed(reason));
        });

        Ok(conn)
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
