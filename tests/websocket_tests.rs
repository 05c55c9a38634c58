#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
#![cfg(feature = "transport-websocket")]
//! WebSocket relay tests against a local mock relay server.
//!
//! The mock accepts one socket, speaks just enough of the channels protocol
//! (`connection_established`, `subscribe`, `ping`/`pong`, `error`) and lets
//! each test script the server side.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use tictac_sync::relay::{RelayClient, RelayConnector, RelayEvent, RelayState};
use tictac_sync::{RelayCredentials, WebSocketConnector};

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

const STEP: Duration = Duration::from_secs(5);

// ════════════════════════════════════════════════════════════════════
// Mock relay server
// ════════════════════════════════════════════════════════════════════

struct MockRelayServer {
    listener: TcpListener,
    port: u16,
}

impl MockRelayServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    fn connector(&self) -> WebSocketConnector {
        WebSocketConnector::with_base_url(format!("ws://127.0.0.1:{}", self.port))
    }

    async fn accept(&self) -> WsStream {
        let (tcp, _) = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    /// Accept and complete the handshake.
    async fn accept_established(&self) -> WsStream {
        let mut ws = self.accept().await;
        send(
            &mut ws,
            json!({
                "event": "pusher:connection_established",
                "data": json!({ "socket_id": "123.456", "activity_timeout": 120 }).to_string(),
            }),
        )
        .await;
        ws
    }
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next text frame from the client, parsed.
async fn read_frame(ws: &mut WsStream) -> Value {
    loop {
        let frame = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("no frame from client")
            .expect("client closed the socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_event(relay: &mut Box<dyn RelayClient>) -> RelayEvent {
    tokio::time::timeout(STEP, relay.next_event())
        .await
        .expect("relay produced no event")
        .expect("relay event stream ended")
}

fn credentials() -> RelayCredentials {
    RelayCredentials {
        key: "test-key".into(),
        cluster: None,
    }
}

async fn connected_relay(server: &MockRelayServer) -> (Box<dyn RelayClient>, WsStream) {
    let mut relay = server.connector().create(&credentials());
    relay.connect().await.unwrap();
    let ws = server.accept_established().await;
    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Connecting)
    );
    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Connected)
    );
    (relay, ws)
}

// ════════════════════════════════════════════════════════════════════
// Handshake and delivery
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn handshake_reports_connected() {
    let server = MockRelayServer::start().await;
    let (mut relay, _ws) = connected_relay(&server).await;
    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn subscribe_sends_frame_and_only_bound_events_arrive() {
    let server = MockRelayServer::start().await;
    let (mut relay, mut ws) = connected_relay(&server).await;

    let handle = relay.subscribe("lobby").await.unwrap();
    relay.bind(handle, "games-updated").await.unwrap();
    // Commands are handled in order, so once this arrives the bind is live.
    relay
        .publish("heartbeat", "client-heartbeat", json!({ "sequence": 1 }))
        .await
        .unwrap();

    assert_eq!(
        read_frame(&mut ws).await,
        json!({ "event": "pusher:subscribe", "data": { "channel": "lobby" } })
    );
    assert_eq!(
        read_frame(&mut ws).await,
        json!({ "event": "client-heartbeat", "channel": "heartbeat", "data": { "sequence": 1 } })
    );

    send(
        &mut ws,
        json!({ "event": "pusher_internal:subscription_succeeded", "channel": "lobby", "data": "{}" }),
    )
    .await;
    send(
        &mut ws,
        json!({ "event": "game-created", "channel": "lobby", "data": "{\"id\":\"1\"}" }),
    )
    .await;
    send(
        &mut ws,
        json!({ "event": "games-updated", "channel": "lobby", "data": "[]" }),
    )
    .await;

    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::Message {
            channel: "lobby".into(),
            event: "games-updated".into(),
            data: json!([]),
        }
    );

    relay.unsubscribe(handle).await.unwrap();
    assert_eq!(
        read_frame(&mut ws).await,
        json!({ "event": "pusher:unsubscribe", "data": { "channel": "lobby" } })
    );
}

#[tokio::test]
async fn subscription_error_is_reported_and_channel_can_be_retried() {
    let server = MockRelayServer::start().await;
    let (mut relay, mut ws) = connected_relay(&server).await;

    let handle = relay.subscribe("user-ann").await.unwrap();
    relay.bind(handle, "stats-updated").await.unwrap();
    assert_eq!(read_frame(&mut ws).await["event"], "pusher:subscribe");

    send(
        &mut ws,
        json!({
            "event": "pusher:subscription_error",
            "channel": "user-ann",
            "data": { "type": "AuthError", "error": "forbidden", "status": 403 },
        }),
    )
    .await;
    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::SubscriptionFailed {
            channel: "user-ann".into(),
            reason: "forbidden".into(),
        }
    );

    relay.unsubscribe(handle).await.unwrap();
    relay.subscribe("user-ann").await.unwrap();
    assert_eq!(read_frame(&mut ws).await["event"], "pusher:unsubscribe");
    assert_eq!(
        read_frame(&mut ws).await,
        json!({ "event": "pusher:subscribe", "data": { "channel": "user-ann" } })
    );
}

#[tokio::test]
async fn server_ping_is_answered() {
    let server = MockRelayServer::start().await;
    let (_relay, mut ws) = connected_relay(&server).await;

    send(&mut ws, json!({ "event": "pusher:ping", "data": {} })).await;
    assert_eq!(read_frame(&mut ws).await["event"], "pusher:pong");
}

#[tokio::test]
async fn unknown_handle_is_a_channel_error() {
    let server = MockRelayServer::start().await;
    let (mut relay, _ws) = connected_relay(&server).await;

    let err = relay
        .bind(tictac_sync::ChannelHandle(99), "games-updated")
        .await
        .unwrap_err();
    assert!(matches!(err, tictac_sync::SyncError::Channel { .. }));
}

// ════════════════════════════════════════════════════════════════════
// Failures
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnect_later_error_suspends() {
    let server = MockRelayServer::start().await;
    let (mut relay, mut ws) = connected_relay(&server).await;

    send(
        &mut ws,
        json!({ "event": "pusher:error", "data": { "message": "over capacity", "code": 4100 } }),
    )
    .await;
    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Suspended {
            reason: Some("over capacity".into())
        })
    );
}

#[tokio::test]
async fn fatal_error_fails() {
    let server = MockRelayServer::start().await;
    let (mut relay, mut ws) = connected_relay(&server).await;

    send(
        &mut ws,
        json!({ "event": "pusher:error", "data": { "message": "app disabled", "code": 4003 } }),
    )
    .await;
    assert!(matches!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Failed { .. })
    ));
}

#[tokio::test]
async fn drop_after_handshake_is_a_disconnect() {
    let server = MockRelayServer::start().await;
    let (mut relay, ws) = connected_relay(&server).await;

    drop(ws);
    assert!(matches!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Disconnected { .. })
    ));
}

#[tokio::test]
async fn close_before_handshake_fails_the_attempt() {
    let server = MockRelayServer::start().await;
    let mut relay = server.connector().create(&credentials());
    relay.connect().await.unwrap();

    let mut ws = server.accept().await;
    ws.close(None).await.unwrap();

    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Connecting)
    );
    assert!(matches!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Failed { .. })
    ));
}

#[tokio::test]
async fn unreachable_server_fails_the_attempt() {
    let server = MockRelayServer::start().await;
    let connector = server.connector();
    drop(server);

    let mut relay = connector.create(&credentials());
    relay.connect().await.unwrap();
    assert_eq!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Connecting)
    );
    assert!(matches!(
        next_event(&mut relay).await,
        RelayEvent::State(RelayState::Failed { .. })
    ));
}

#[tokio::test]
async fn commands_before_connect_are_rejected() {
    let mut relay = WebSocketConnector::with_base_url("ws://127.0.0.1:9")
        .create(&credentials());
    let err = relay.subscribe("lobby").await.unwrap_err();
    assert!(matches!(err, tictac_sync::SyncError::Connection(_)));
}

#[tokio::test]
async fn disconnect_closes_the_socket() {
    let server = MockRelayServer::start().await;
    let (mut relay, mut ws) = connected_relay(&server).await;

    relay.disconnect().await.unwrap();
    let frame = tokio::time::timeout(STEP, ws.next()).await.unwrap();
    assert!(matches!(frame, Some(Ok(Message::Close(_))) | None));
}
