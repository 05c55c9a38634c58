//! WebSocket relay client speaking the Pusher channels protocol (v7).
//!
//! [`WebSocketConnector`] builds a [`WebSocketRelay`] per connection attempt.
//! On [`connect`](RelayClient::connect) the relay spawns a socket task that
//! owns the `tokio-tungstenite` stream; the relay handle forwards
//! subscribe/bind/publish commands to it over a channel and receives
//! [`RelayEvent`]s back. Both `ws://` and `wss://` URLs are supported via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! The task keeps the connection alive the way the protocol expects: after
//! `activity_timeout` without inbound traffic it sends `pusher:ping`, and if
//! no frame arrives within [`PONG_TIMEOUT`] it reports the connection lost.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (on by default).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SyncError};
use crate::error_codes::{RelayErrorCode, RetryClass};
use crate::protocol::RelayCredentials;
use crate::relay::{ChannelHandle, RelayClient, RelayConnector, RelayEvent, RelayState};

const PROTOCOL_VERSION: &str = "7";
const CLIENT_NAME: &str = "tictac-sync";
const DEFAULT_CLUSTER: &str = "mt1";
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
/// How long to wait for any frame after sending `pusher:ping`.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Connector ───────────────────────────────────────────────────────

/// Creates [`WebSocketRelay`]s for the hosted relay, or for a self-hosted
/// endpoint given with [`with_base_url`](Self::with_base_url).
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    base_url: Option<String>,
}

impl WebSocketConnector {
    /// Connect to `wss://ws-<cluster>.pusher.com`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `base_url` (e.g. `ws://127.0.0.1:6001`) instead of the
    /// hosted cluster.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
        }
    }

    /// The socket URL used for `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the base URL cannot be parsed.
    pub fn relay_url(&self, credentials: &RelayCredentials) -> Result<String> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => format!(
                "wss://ws-{}.pusher.com",
                credentials.cluster.as_deref().unwrap_or(DEFAULT_CLUSTER)
            ),
        };
        let mut url = url::Url::parse(&base)
            .map_err(|e| SyncError::Config(format!("invalid relay url `{base}`: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| SyncError::Config(format!("relay url `{base}` cannot have a path")))?
            .pop_if_empty()
            .push("app")
            .push(&credentials.key);
        url.query_pairs_mut()
            .append_pair("protocol", PROTOCOL_VERSION)
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url.to_string())
    }
}

impl RelayConnector for WebSocketConnector {
    fn create(&self, credentials: &RelayCredentials) -> Box<dyn RelayClient> {
        Box::new(WebSocketRelay::new(self.relay_url(credentials)))
    }
}

// ── Relay handle ────────────────────────────────────────────────────

#[derive(Debug)]
enum Outbound {
    Subscribe(String),
    Unsubscribe(String),
    Bind { channel: String, event: String },
    UnbindAll(String),
    Publish {
        channel: String,
        event: String,
        data: Value,
    },
    Close,
}

/// A [`RelayClient`] backed by one WebSocket connection.
///
/// # Cancel Safety
///
/// [`next_event`](RelayClient::next_event) reads from an mpsc receiver and is
/// cancel-safe.
#[derive(Debug)]
pub struct WebSocketRelay {
    url: Result<String>,
    commands: Option<mpsc::UnboundedSender<Outbound>>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
    next_handle: u64,
    channels: HashMap<ChannelHandle, String>,
}

impl WebSocketRelay {
    fn new(url: Result<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url,
            commands: None,
            events_tx,
            events_rx,
            task: None,
            next_handle: 0,
            channels: HashMap::new(),
        }
    }

    fn command(&self, cmd: Outbound) -> Result<()> {
        let tx = self
            .commands
            .as_ref()
            .ok_or_else(|| SyncError::Connection("relay is not connected".into()))?;
        tx.send(cmd)
            .map_err(|_| SyncError::Connection("relay socket closed".into()))
    }

    fn channel(&self, handle: ChannelHandle) -> Result<String> {
        self.channels
            .get(&handle)
            .cloned()
            .ok_or_else(|| SyncError::Channel {
                channel: format!("#{}", handle.0),
                message: "unknown channel handle".into(),
            })
    }
}

#[async_trait]
impl RelayClient for WebSocketRelay {
    async fn connect(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(SyncError::Connection("relay already started".into()));
        }
        let url = match &self.url {
            Ok(url) => url.clone(),
            Err(SyncError::Config(message)) => return Err(SyncError::Config(message.clone())),
            Err(other) => return Err(SyncError::Connection(other.to_string())),
        };
        debug!(url = %url, "starting relay socket");
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.commands = Some(commands_tx);
        self.task = Some(tokio::spawn(run_socket(
            url,
            commands_rx,
            self.events_tx.clone(),
        )));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("relay socket did not close in time; aborting");
                task.abort();
            }
        }
        self.channels.clear();
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<ChannelHandle> {
        self.command(Outbound::Subscribe(channel.to_string()))?;
        self.next_handle += 1;
        let handle = ChannelHandle(self.next_handle);
        self.channels.insert(handle, channel.to_string());
        Ok(handle)
    }

    async fn bind(&mut self, handle: ChannelHandle, event: &str) -> Result<()> {
        let channel = self.channel(handle)?;
        self.command(Outbound::Bind {
            channel,
            event: event.to_string(),
        })
    }

    async fn unbind_all(&mut self, handle: ChannelHandle) -> Result<()> {
        let channel = self.channel(handle)?;
        self.command(Outbound::UnbindAll(channel))
    }

    async fn unsubscribe(&mut self, handle: ChannelHandle) -> Result<()> {
        let channel = self.channel(handle)?;
        self.channels.remove(&handle);
        self.command(Outbound::Unsubscribe(channel))
    }

    async fn publish(&mut self, channel: &str, event: &str, payload: Value) -> Result<()> {
        self.command(Outbound::Publish {
            channel: channel.to_string(),
            event: event.to_string(),
            data: payload,
        })
    }

    async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events_rx.recv().await
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Protocol session ────────────────────────────────────────────────

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct Established {
    #[serde(default)]
    socket_id: Option<String>,
    #[serde(default)]
    activity_timeout: Option<u64>,
}

#[derive(Deserialize)]
struct PusherError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

/// Payload of `pusher:subscription_error`.
#[derive(Deserialize, Default)]
struct SubscriptionRejection {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

/// What the socket task should do with an inbound frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Ignore,
    Emit(RelayEvent),
    Reply(Value),
    /// Report `state` and close the socket.
    Stop(RelayState),
}

/// Protocol state of one socket, kept free of I/O.
#[derive(Debug)]
struct Session {
    bindings: HashMap<String, HashSet<String>>,
    activity_timeout: Duration,
    established: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            established: false,
        }
    }

    /// Frame to send for `cmd`, if any. Bindings only change local filtering.
    fn outbound(&mut self, cmd: Outbound) -> Option<Value> {
        match cmd {
            Outbound::Subscribe(channel) => Some(json!({
                "event": "pusher:subscribe",
                "data": { "channel": channel },
            })),
            Outbound::Unsubscribe(channel) => {
                self.bindings.remove(&channel);
                Some(json!({
                    "event": "pusher:unsubscribe",
                    "data": { "channel": channel },
                }))
            }
            Outbound::Bind { channel, event } => {
                self.bindings.entry(channel).or_default().insert(event);
                None
            }
            Outbound::UnbindAll(channel) => {
                self.bindings.remove(&channel);
                None
            }
            Outbound::Publish {
                channel,
                event,
                data,
            } => Some(json!({
                "event": event,
                "channel": channel,
                "data": data,
            })),
            Outbound::Close => None,
        }
    }

    fn inbound(&mut self, text: &str) -> Inbound {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unparseable relay frame: {e}");
                return Inbound::Ignore;
            }
        };
        let data = unwrap_data(frame.data);

        match frame.event.as_str() {
            "pusher:connection_established" => {
                let info: Established = serde_json::from_value(data).unwrap_or(Established {
                    socket_id: None,
                    activity_timeout: None,
                });
                if let Some(secs) = info.activity_timeout {
                    self.activity_timeout = Duration::from_secs(secs).min(DEFAULT_ACTIVITY_TIMEOUT);
                }
                self.established = true;
                info!(socket_id = ?info.socket_id, "relay connection established");
                Inbound::Emit(RelayEvent::State(RelayState::Connected))
            }
            "pusher:error" => {
                let error: PusherError = serde_json::from_value(data).unwrap_or(PusherError {
                    message: None,
                    code: None,
                });
                let message = error.message.unwrap_or_else(|| "relay error".into());
                match error.code {
                    Some(code) => {
                        warn!(code, %message, "relay reported error");
                        Inbound::Stop(self.closed_with(Some(code), message))
                    }
                    None => {
                        warn!(%message, "relay reported error without code");
                        Inbound::Ignore
                    }
                }
            }
            "pusher:ping" => Inbound::Reply(json!({ "event": "pusher:pong", "data": {} })),
            "pusher:pong" => Inbound::Ignore,
            "pusher_internal:subscription_succeeded" => {
                debug!(channel = ?frame.channel, "subscription confirmed");
                Inbound::Ignore
            }
            "pusher:subscription_error" => {
                let Some(channel) = frame.channel else {
                    warn!("subscription error without channel");
                    return Inbound::Ignore;
                };
                let rejection: SubscriptionRejection =
                    serde_json::from_value(data).unwrap_or_default();
                let reason = rejection
                    .error
                    .or(rejection.kind)
                    .unwrap_or_else(|| "subscription rejected".into());
                warn!(%channel, status = ?rejection.status, %reason, "subscription rejected by relay");
                self.bindings.remove(&channel);
                Inbound::Emit(RelayEvent::SubscriptionFailed { channel, reason })
            }
            event => {
                let Some(channel) = frame.channel else {
                    trace!(event, "ignoring frame without channel");
                    return Inbound::Ignore;
                };
                let bound = self
                    .bindings
                    .get(&channel)
                    .is_some_and(|events| events.contains(event));
                if !bound {
                    trace!(%channel, event, "ignoring unbound event");
                    return Inbound::Ignore;
                }
                Inbound::Emit(RelayEvent::Message {
                    channel,
                    event: event.to_string(),
                    data,
                })
            }
        }
    }

    /// State to report when the socket ends with `code`.
    fn closed_with(&self, code: Option<u16>, reason: String) -> RelayState {
        let class = code
            .filter(|c| (4000..5000).contains(c))
            .map(|c| RelayErrorCode::from_code(c).retry_class());
        match class {
            Some(RetryClass::Fatal) => RelayState::Failed { reason },
            Some(RetryClass::ReconnectLater) => RelayState::Suspended {
                reason: Some(reason),
            },
            Some(RetryClass::ReconnectNow) | None => self.lost(reason),
        }
    }

    /// A drop before the handshake finished fails the attempt.
    fn lost(&self, reason: String) -> RelayState {
        if self.established {
            RelayState::Disconnected {
                reason: Some(reason),
            }
        } else {
            RelayState::Failed { reason }
        }
    }
}

/// Pusher double-encodes `data` as a JSON string; decode it when possible.
fn unwrap_data(data: Value) -> Value {
    match data {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

// ── Socket task ─────────────────────────────────────────────────────

enum Exit {
    /// Closed on request of the relay handle.
    Requested,
    /// State already reported.
    Stopped,
    Lost(String),
    ClosedByServer(Option<u16>, String),
}

async fn run_socket(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    emit(&events, RelayEvent::State(RelayState::Connecting));
    let mut ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("relay socket connect failed: {e}");
            emit(
                &events,
                RelayEvent::State(RelayState::Failed {
                    reason: e.to_string(),
                }),
            );
            return;
        }
    };

    let mut session = Session::new();
    let mut idle_deadline = Instant::now() + session.activity_timeout;
    let mut pong_deadline: Option<Instant> = None;

    let exit = loop {
        let deadline = pong_deadline.unwrap_or(idle_deadline);
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break Exit::Requested };
                if matches!(cmd, Outbound::Close) {
                    break Exit::Requested;
                }
                if let Some(frame) = session.outbound(cmd) {
                    if let Err(e) = send_frame(&mut ws, &frame).await {
                        break Exit::Lost(format!("send failed: {e}"));
                    }
                }
            }

            frame = ws.next() => {
                idle_deadline = Instant::now() + session.activity_timeout;
                pong_deadline = None;
                match frame {
                    Some(Ok(Message::Text(text))) => match session.inbound(text.as_str()) {
                        Inbound::Ignore => {}
                        Inbound::Emit(event) => emit(&events, event),
                        Inbound::Reply(reply) => {
                            if let Err(e) = send_frame(&mut ws, &reply).await {
                                break Exit::Lost(format!("send failed: {e}"));
                            }
                        }
                        Inbound::Stop(state) => {
                            emit(&events, RelayEvent::State(state));
                            break Exit::Stopped;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                            None => (None, "closed by relay".to_string()),
                        };
                        break Exit::ClosedByServer(code, reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Lost(e.to_string()),
                    None => break Exit::Lost("connection closed".into()),
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                if pong_deadline.is_some() {
                    break Exit::Lost("pong not received".into());
                }
                trace!("relay idle, sending ping");
                if let Err(e) = send_frame(&mut ws, &json!({ "event": "pusher:ping", "data": {} })).await {
                    break Exit::Lost(format!("send failed: {e}"));
                }
                pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
            }
        }
    };

    match exit {
        Exit::Requested | Exit::Stopped => {
            if let Err(e) = ws.close(None).await {
                trace!("relay socket close: {e}");
            }
        }
        Exit::Lost(reason) => {
            warn!(%reason, "relay socket lost");
            emit(&events, RelayEvent::State(session.lost(reason)));
        }
        Exit::ClosedByServer(code, reason) => {
            info!(?code, %reason, "relay closed the socket");
            emit(&events, RelayEvent::State(session.closed_with(code, reason)));
        }
    }
    debug!("relay socket task exited");
}

async fn send_frame(ws: &mut WsStream, frame: &Value) -> std::result::Result<(), String> {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|e| e.to_string())
}

fn emit(events: &mpsc::UnboundedSender<RelayEvent>, event: RelayEvent) {
    if events.send(event).is_err() {
        debug!("relay event receiver dropped");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn credentials(cluster: Option<&str>) -> RelayCredentials {
        RelayCredentials {
            key: "app-key".into(),
            cluster: cluster.map(str::to_string),
        }
    }

    fn established(session: &mut Session) {
        session.inbound(
            r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\",\"activity_timeout\":30}"}"#,
        );
    }

    #[test]
    fn hosted_url_uses_cluster() {
        let url = WebSocketConnector::new()
            .relay_url(&credentials(Some("eu")))
            .unwrap();
        assert!(url.starts_with("wss://ws-eu.pusher.com/app/app-key?"));
        assert!(url.contains("protocol=7"));
        assert!(url.contains("client=tictac-sync"));
    }

    #[test]
    fn base_url_override() {
        let url = WebSocketConnector::with_base_url("ws://127.0.0.1:6001")
            .relay_url(&credentials(None))
            .unwrap();
        assert!(url.starts_with("ws://127.0.0.1:6001/app/app-key?"));
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let err = WebSocketConnector::with_base_url("not a url")
            .relay_url(&credentials(None))
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn established_reports_connected_and_adopts_timeout() {
        let mut session = Session::new();
        let action = session.inbound(
            r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\",\"activity_timeout\":30}"}"#,
        );
        assert_eq!(action, Inbound::Emit(RelayEvent::State(RelayState::Connected)));
        assert_eq!(session.activity_timeout, Duration::from_secs(30));
    }

    #[test]
    fn only_bound_events_are_emitted() {
        let mut session = Session::new();
        established(&mut session);
        session.outbound(Outbound::Bind {
            channel: "lobby".into(),
            event: "games-updated".into(),
        });

        let bound = session.inbound(r#"{"event":"games-updated","channel":"lobby","data":"[]"}"#);
        assert_eq!(
            bound,
            Inbound::Emit(RelayEvent::Message {
                channel: "lobby".into(),
                event: "games-updated".into(),
                data: json!([]),
            })
        );
        let unbound = session.inbound(r#"{"event":"game-created","channel":"lobby","data":"{}"}"#);
        assert_eq!(unbound, Inbound::Ignore);

        session.outbound(Outbound::UnbindAll("lobby".into()));
        let after = session.inbound(r#"{"event":"games-updated","channel":"lobby","data":"[]"}"#);
        assert_eq!(after, Inbound::Ignore);
    }

    #[test]
    fn ping_gets_a_pong() {
        let mut session = Session::new();
        let action = session.inbound(r#"{"event":"pusher:ping","data":{}}"#);
        assert_eq!(action, Inbound::Reply(json!({"event": "pusher:pong", "data": {}})));
    }

    #[test]
    fn error_codes_map_to_relay_states() {
        let mut session = Session::new();
        established(&mut session);

        let fatal = session.inbound(r#"{"event":"pusher:error","data":{"message":"bad key","code":4001}}"#);
        assert!(matches!(fatal, Inbound::Stop(RelayState::Failed { .. })));

        let later = session.inbound(r#"{"event":"pusher:error","data":{"message":"over capacity","code":4100}}"#);
        assert!(matches!(later, Inbound::Stop(RelayState::Suspended { .. })));

        let now = session.inbound(r#"{"event":"pusher:error","data":{"message":"pong","code":4201}}"#);
        assert!(matches!(now, Inbound::Stop(RelayState::Disconnected { .. })));

        let no_code = session.inbound(r#"{"event":"pusher:error","data":{"message":"whatever"}}"#);
        assert_eq!(no_code, Inbound::Ignore);
    }

    #[test]
    fn subscription_error_reports_channel_and_drops_bindings() {
        let mut session = Session::new();
        established(&mut session);
        session.outbound(Outbound::Bind {
            channel: "game-9".into(),
            event: "game-updated".into(),
        });

        let action = session.inbound(
            r#"{"event":"pusher:subscription_error","channel":"game-9","data":{"type":"AuthError","error":"forbidden","status":403}}"#,
        );
        assert_eq!(
            action,
            Inbound::Emit(RelayEvent::SubscriptionFailed {
                channel: "game-9".into(),
                reason: "forbidden".into(),
            })
        );
        let after = session.inbound(r#"{"event":"game-updated","channel":"game-9","data":"{}"}"#);
        assert_eq!(after, Inbound::Ignore);

        let bare = session.inbound(r#"{"event":"pusher:subscription_error","channel":"lobby","data":"{}"}"#);
        assert!(matches!(
            bare,
            Inbound::Emit(RelayEvent::SubscriptionFailed { ref reason, .. }) if reason == "subscription rejected"
        ));
    }

    #[test]
    fn loss_before_handshake_is_a_failure() {
        let session = Session::new();
        assert!(matches!(
            session.lost("reset".into()),
            RelayState::Failed { .. }
        ));
        assert!(matches!(
            session.closed_with(Some(1000), "bye".into()),
            RelayState::Failed { .. }
        ));
    }

    #[test]
    fn subscribe_and_publish_frames() {
        let mut session = Session::new();
        assert_eq!(
            session.outbound(Outbound::Subscribe("game-1".into())),
            Some(json!({"event": "pusher:subscribe", "data": {"channel": "game-1"}}))
        );
        assert_eq!(
            session.outbound(Outbound::Publish {
                channel: "heartbeat".into(),
                event: "client-heartbeat".into(),
                data: json!({"sequence": 1}),
            }),
            Some(json!({"event": "client-heartbeat", "channel": "heartbeat", "data": {"sequence": 1}}))
        );
    }

    #[test]
    fn websocket_relay_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketRelay>();
    }
}
