//! Scripted agent server.
//!
//! Run with: cargo run -p mock-agent
//!
//! Serves `ws://127.0.0.1:8000/api/agent/ws`. Every turn gets a `status`
//! frame followed by three numbered steps ending in an `action_output`.
//! A turn whose content mentions "fail" gets an `error` frame instead.

use std::{
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use agent_session_core::{StepRecord, ToolCall, Turn};
use agent_session_transport::{InboundMessage, decode_turn};
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(about = "Scripted agent server for the session client")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "MOCK_AGENT_ADDR", default_value = "127.0.0.1:8000")]
    addr: SocketAddr,

    /// Pause between streamed steps, in milliseconds.
    #[arg(long, env = "MOCK_AGENT_STEP_DELAY_MS", default_value_t = 400)]
    step_delay_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct AppState {
    step_delay: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let state = AppState {
        step_delay: Duration::from_millis(args.step_delay_ms),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/agent/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    tracing::info!("Mock agent listening on ws://{}/api/agent/ws", args.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Sender = SplitSink<WebSocket, Message>;

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    tracing::info!(%conn_id, "client connected");

    while let Some(Ok(msg)) = receiver.next().await {
        let raw = match msg {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Close(_) => break,
            _ => continue,
        };

        let result = match decode_turn(&raw) {
            Ok(turn) => run_turn(&mut sender, &turn, state.step_delay).await,
            Err(e) => send(&mut sender, InboundMessage::Error(e.to_string())).await,
        };
        if let Err(e) = result {
            tracing::warn!(%conn_id, error = %e, "send failed");
            break;
        }
    }

    tracing::info!(%conn_id, "client disconnected");
}

async fn run_turn(sender: &mut Sender, turn: &Turn, step_delay: Duration) -> anyhow::Result<()> {
    tracing::info!(content = %turn.content, "turn received");
    send(sender, InboundMessage::Status("Agent is thinking".into())).await?;

    if turn.content.to_lowercase().contains("fail") {
        tokio::time::sleep(step_delay).await;
        return send(sender, InboundMessage::Error("Agent run failed on request".into())).await;
    }

    for step in script(turn) {
        tokio::time::sleep(step_delay).await;
        send(sender, InboundMessage::StepUpdate(step)).await?;
    }
    Ok(())
}

/// The canned trace for one turn.
fn script(turn: &Turn) -> Vec<StepRecord> {
    let t0 = now();
    let context_keys = turn
        .context
        .as_ref()
        .map(|c| c.as_map().keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default();

    let mut arguments = serde_json::Map::new();
    arguments.insert("query".into(), turn.content.clone().into());

    vec![
        StepRecord::new(1, t0, t0 + 0.8)
            .with_model_output("I should look up what the user is asking about.")
            .with_tool_call(ToolCall {
                name: "search".into(),
                arguments,
                id: "call_1".into(),
            })
            .with_observations(format!("Found 3 results for \"{}\"", turn.content)),
        StepRecord::new(2, t0 + 0.8, t0 + 1.5).with_observations(if context_keys.is_empty() {
            "No context supplied".to_string()
        } else {
            format!("Context keys: {context_keys}")
        }),
        StepRecord::new(3, t0 + 1.5, t0 + 2.1)
            .with_action_output(format!("Done: {}", turn.content.trim())),
    ]
}

async fn send(sender: &mut Sender, message: InboundMessage) -> anyhow::Result<()> {
    let frame = message.to_frame()?;
    sender.send(Message::Text(frame.into())).await?;
    Ok(())
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
