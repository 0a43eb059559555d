//! End-to-end: a real `SessionClient` over WebSocket against an in-process
//! agent that streams a two-step trace, drops the socket mid-turn and
//! serves the retried turn on the reconnected socket.

use std::time::Duration;

use agent_session_client::{
    BackoffPolicy, ClientConfig, ConnectionState, SessionClient, SessionEvent, Turn, TurnContext,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const STEP_1: &str = r#"{"type":"step_update","step":{"step_number":1,"start_time":1.0,"end_time":2.0,"duration":1.0,"observations":"read the document","tool_calls":[{"name":"read_file","arguments":{"path":"doc.md"},"id":"call_1"}]}}"#;
const STEP_2: &str = r#"{"type":"step_update","step":{"step_number":2,"start_time":2.0,"end_time":3.5,"duration":1.5,"action_output":"Summary: ..."}}"#;

/// Boots the scripted agent. Returns its URL and a channel of every turn
/// frame it received, in order.
async fn scripted_agent() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (turns_tx, turns_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        // First socket: one step, then the connection drops.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(turn))) = ws.next().await {
            turns_tx.send(turn).unwrap();
        }
        ws.send(Message::Text(STEP_1.into())).await.unwrap();
        drop(ws);

        // Second socket: full trace.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(turn))) = ws.next().await {
            turns_tx.send(turn).unwrap();
        }
        ws.send(Message::Text(r#"{"type":"status","detail":"working"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text(STEP_1.into())).await.unwrap();
        ws.send(Message::Text(STEP_2.into())).await.unwrap();
        // Hold the socket open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    (format!("ws://{addr}"), turns_rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session event stream ended")
}

async fn wait_for(events: &mut mpsc::UnboundedReceiver<SessionEvent>, expected: &SessionEvent) {
    loop {
        if next_event(events).await == *expected {
            return;
        }
    }
}

#[tokio::test]
async fn test_turn_survives_a_dropped_socket() {
    let (url, mut turns) = scripted_agent().await;
    let config = ClientConfig::builder()
        .url(url)
        .backoff(BackoffPolicy::constant(Duration::from_millis(100)))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let (client, mut events) = SessionClient::websocket(&config);
    client.start().unwrap();
    let connected = SessionEvent::ConnectionStateChanged(ConnectionState::Connected);
    wait_for(&mut events, &connected).await;

    let turn = Turn::new("summarize doc").with_context(TurnContext::new().with("doc", "doc.md"));
    client.send_turn(&turn).unwrap();
    assert_eq!(
        turns.recv().await.unwrap(),
        r#"{"content":"summarize doc","context":{"doc":"doc.md"}}"#
    );

    let SessionEvent::StepAppended(trace) = next_event(&mut events).await else {
        panic!("expected the first step");
    };
    assert_eq!(trace.step_numbers(), vec![1]);
    assert_eq!(trace.steps()[0].tool_calls[0].name, "read_file");

    wait_for(
        &mut events,
        &SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected),
    )
    .await;
    assert!(!client.turn_in_flight());

    wait_for(&mut events, &connected).await;
    client.send_turn(&turn).unwrap();
    assert!(turns.recv().await.is_some());

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Status("working".into())
    );
    wait_for(&mut events, &SessionEvent::TurnCompleted("Summary: ...".into())).await;

    let trace = client.trace();
    assert_eq!(trace.step_numbers(), vec![1, 2]);
    assert_eq!(trace.final_output(), Some("Summary: ..."));
    assert!((trace.steps()[1].duration - 1.5).abs() < f64::EPSILON);
    assert_eq!(client.diagnostics().sequence_gaps, 0);

    client.stop();
}

#[tokio::test]
async fn test_unreachable_agent_rejects_turns() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::builder()
        .url(format!("ws://{addr}"))
        .backoff(BackoffPolicy::constant(Duration::from_millis(200)))
        .build()
        .unwrap();
    let (client, mut events) = SessionClient::websocket(&config);
    client.start().unwrap();

    wait_for(
        &mut events,
        &SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected),
    )
    .await;
    assert!(client.send_turn(&Turn::new("hello")).is_err());
    assert!(!client.turn_in_flight());

    client.stop();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
