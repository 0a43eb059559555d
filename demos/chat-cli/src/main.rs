//! Terminal chat against a remote agent.
//!
//! Run with: cargo run -p chat-cli -- --url ws://127.0.0.1:8000
//!
//! Each line typed is sent as a turn. Steps are printed as they stream in.

mod render;

use std::path::PathBuf;

use agent_session_client::{
    ClientSettings, ConnectionState, SessionClient, SessionError, SessionEvent, Trace, Turn,
    TurnContext,
};
use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Chat with a remote agent over WebSocket")]
struct Args {
    /// Agent service base URL.
    #[arg(long, env = "AGENT_WS_URL", default_value = "ws://localhost:8000")]
    url: String,

    /// Path of the agent WebSocket endpoint.
    #[arg(long, env = "AGENT_WS_PATH", default_value = "/api/agent/ws")]
    path: String,

    /// Delay before reconnecting, in milliseconds.
    #[arg(long, env = "AGENT_RECONNECT_MS", default_value_t = 3000)]
    reconnect_ms: u64,

    /// Upper bound for exponential reconnect backoff, in milliseconds.
    #[arg(long, env = "AGENT_RECONNECT_MAX_MS")]
    reconnect_max_ms: Option<u64>,

    /// Give up on a connection attempt after this many milliseconds.
    #[arg(long, env = "AGENT_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// JSON settings file. Replaces the connection flags above.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Context attached to every turn, as key=value. Repeatable.
    #[arg(long = "context", value_parser = render::parse_context_pair)]
    context: Vec<(String, serde_json::Value)>,
}

impl Args {
    fn settings(&self) -> anyhow::Result<ClientSettings> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()));
        }
        Ok(ClientSettings {
            base_url: self.url.clone(),
            path: self.path.clone(),
            reconnect_ms: self.reconnect_ms,
            reconnect_max_ms: self.reconnect_max_ms,
            connect_timeout_ms: self.connect_timeout_ms,
        })
    }

    fn turn_context(&self) -> Option<TurnContext> {
        if self.context.is_empty() {
            None
        } else {
            Some(self.context.iter().cloned().collect())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.settings()?.into_config()?;
    let context = args.turn_context();

    let (client, mut events) = SessionClient::websocket(&config);
    client.start()?;
    println!("Connecting to {} ...", config.url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let turn = Turn {
                    content: line,
                    context: context.clone(),
                };
                match client.send_turn(&turn) {
                    Ok(()) => {
                        printed = 0;
                        println!("Agent is thinking...");
                    }
                    Err(SessionError::Offline) => {
                        println!("! Agent service is offline; message not sent. Retrying connection...");
                    }
                    Err(e) => println!("! {e}"),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                on_event(event, &mut printed);
            }
        }
    }

    client.stop();
    Ok(())
}

fn on_event(event: SessionEvent, printed: &mut usize) {
    match event {
        SessionEvent::StepAppended(trace) => print_new_steps(&trace, printed),
        SessionEvent::TurnCompleted(output) => println!("\n{output}\n"),
        SessionEvent::TurnFailed(detail) => println!("! Agent error: {detail}"),
        SessionEvent::ProtocolError(detail) => println!("! Protocol: {detail}"),
        SessionEvent::Status(detail) => println!("~ {detail}"),
        SessionEvent::ConnectionStateChanged(state) => match state {
            ConnectionState::Connected => println!("Connected. Type a message and press enter."),
            ConnectionState::Disconnected => println!("Disconnected."),
            ConnectionState::Connecting => {}
        },
    }
}

fn print_new_steps(trace: &Trace, printed: &mut usize) {
    if trace.len() < *printed {
        *printed = 0;
    }
    for step in trace.steps().iter().skip(*printed) {
        print!("{}", render::step_card(step));
    }
    *printed = trace.len();
}
