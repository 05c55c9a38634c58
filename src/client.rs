//! Async connection and synchronization manager.
//!
//! [`SyncClient`] is a thin handle to a background sync loop task. The loop
//! exclusively owns the relay client, the [`ConnectionStateMachine`], the
//! [`ChannelRegistry`], the [`SyncBridge`], the [`RateLimiter`], and every
//! timer, so none of them needs a lock. The handle talks to the loop over an
//! unbounded command channel; requests that need an answer carry a oneshot
//! reply sender.
//!
//! The UI observes state through a [`tokio::sync::watch`] channel of
//! [`SyncView`] snapshots, published after every loop iteration that changed
//! something.
//!
//! # Example
//!
//! ```rust,ignore
//! let api = Arc::new(HttpGameApi::new("https://example.com/api/")?);
//! let (client, mut view) = SyncClient::start(
//!     WebSocketConnector::new(),
//!     api.clone(),
//!     api,
//!     SyncConfig::new(),
//! );
//!
//! client.connect()?;
//! client.subscribe_to_lobby().await?;
//! client.join_game("42", "alice").await?;
//!
//! while view.changed().await.is_ok() {
//!     let snapshot = view.borrow().clone();
//!     render(&snapshot);
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::api::{ConfigSource, GameApi};
use crate::backoff::BackoffPolicy;
use crate::channels::ChannelRegistry;
use crate::config_cache::{ConfigCache, DEFAULT_CONFIG_TTL};
use crate::connection::{ConnectionState, ConnectionStateMachine, Effect};
use crate::error::{Result, SyncError};
use crate::protocol::{
    events, ChannelKind, ChatMessage, Game, Heartbeat, PlayerStats, RelayCredentials, SyncUpdate,
    HEARTBEAT_CHANNEL,
};
use crate::rate_limit::{rules, RateLimiter, RateRule};
use crate::relay::{RelayClient, RelayConnector, RelayEvent, RelayState};
use crate::sync::{SyncBridge, SyncSource};
use crate::timer::Timer;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_MANUAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Tuning for a [`SyncClient`].
///
/// # Example
///
/// ```
/// use tictac_sync::client::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new()
///     .with_max_attempts(3)
///     .with_poll_interval(Duration::from_secs(10));
/// assert_eq!(config.max_attempts, 3);
/// assert_eq!(config.connect_timeout, Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long one attempt may stay in `connecting`. Defaults to **15 s**.
    pub connect_timeout: Duration,
    /// Delay policy between automatic retries. Defaults to **1 s / 30 s**.
    pub backoff: BackoffPolicy,
    /// Automatic attempts before giving up. Defaults to **5**.
    pub max_attempts: u32,
    /// Interval of the keepalive publish while connected. Defaults to **30 s**.
    pub heartbeat_interval: Duration,
    /// How long a dropped connection may self-heal before it counts as
    /// suspended. Defaults to **5 s**.
    pub disconnect_grace: Duration,
    /// Debounce before a manual reconnect starts. Defaults to **500 ms**.
    pub manual_reconnect_delay: Duration,
    /// Interval of fallback polling. Defaults to **5 s**.
    pub poll_interval: Duration,
    /// Lifetime of cached relay credentials. Defaults to **5 min**.
    pub config_ttl: Duration,
    /// Grace given to the sync loop on [`SyncClient::shutdown`] before it is
    /// aborted. Defaults to **1 s**.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            manual_reconnect_delay: DEFAULT_MANUAL_RECONNECT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            config_ttl: DEFAULT_CONFIG_TTL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    #[must_use]
    pub fn with_manual_reconnect_delay(mut self, delay: Duration) -> Self {
        self.manual_reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_config_ttl(mut self, ttl: Duration) -> Self {
        self.config_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Observed state ──────────────────────────────────────────────────

/// Snapshot of everything the UI renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncView {
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    /// `true` while an attempt is in `connecting`.
    pub is_initializing: bool,
    /// Last connection failure, cleared once connected.
    pub connection_error: Option<String>,
    /// Last subscription the relay refused after accepting the request.
    pub channel_error: Option<String>,
    pub is_fallback_mode: bool,
    pub reconnect_attempts: u32,
    pub games: Vec<Game>,
    pub current_game: Option<Game>,
    pub chat_messages: Vec<ChatMessage>,
    pub player_stats: Option<PlayerStats>,
}

// ── Commands ────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect,
    Disconnect,
    ManualReconnect,
    JoinGame {
        game_id: String,
        username: String,
        reply: Reply<Game>,
    },
    LeaveGame {
        reply: Reply<()>,
    },
    SubscribeLobby {
        reply: Reply<()>,
    },
    SubscribeUser {
        username: String,
        reply: Reply<()>,
    },
    CreateGame {
        username: String,
        reply: Reply<Game>,
    },
    MakeMove {
        position: usize,
        reply: Reply<()>,
    },
    SendChat {
        message: String,
        reply: Reply<()>,
    },
}

/// Results of work the loop spawned off itself.
enum Internal {
    ConfigFetched {
        attempt: u64,
        result: Result<RelayCredentials>,
    },
    JoinFetched {
        generation: u64,
        result: Result<(Game, Vec<ChatMessage>)>,
        reply: Reply<Game>,
    },
    Fetched {
        source: SyncSource,
        /// Join generation the fetch belongs to, for game-scoped reads.
        generation: Option<u64>,
        result: Result<SyncUpdate>,
    },
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running sync loop.
///
/// `connect`, `disconnect`, and `manual_reconnect` only queue a command and
/// return; their outcome is observed through [`SyncView`]. The remaining
/// actions wait for the loop's answer.
pub struct SyncClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<SyncView>,
    session_id: Uuid,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SyncClient {
    /// Spawn the sync loop and return a handle plus a view receiver.
    ///
    /// Nothing connects until [`connect`](Self::connect) is called.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use = "the view receiver is how connection and game state are observed"]
    pub fn start(
        connector: impl RelayConnector,
        api: Arc<dyn GameApi>,
        config_source: Arc<dyn ConfigSource>,
        config: SyncConfig,
    ) -> (Self, watch::Receiver<SyncView>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SyncView::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session_id = Uuid::new_v4();
        let shutdown_timeout = config.shutdown_timeout;

        let sync_loop = SyncLoop {
            session_id,
            machine: ConnectionStateMachine::new(config.backoff, config.max_attempts),
            config_cache: ConfigCache::new(config.config_ttl),
            config,
            connector: Box::new(connector),
            api,
            config_source,
            relay: None,
            registry: ChannelRegistry::new(),
            bridge: SyncBridge::new(),
            limiter: RateLimiter::new(),
            want_lobby: false,
            want_user: None,
            attempt_id: 0,
            channel_error: None,
            heartbeat_seq: 0,
            connect_timer: Timer::new(),
            retry_timer: Timer::new(),
            heartbeat_timer: Timer::new(),
            grace_timer: Timer::new(),
            poll_timer: Timer::new(),
            manual_timer: Timer::new(),
            internal_tx,
            view_tx,
        };
        let span = tracing::info_span!("sync_loop", session = %session_id);
        let task = tokio::spawn(
            sync_loop
                .run(cmd_rx, internal_rx, shutdown_rx)
                .instrument(span),
        );

        let client = Self {
            cmd_tx,
            view_rx: view_rx.clone(),
            session_id,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (client, view_rx)
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Start connecting. A no-op while an attempt is in flight or connected.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the sync loop has exited.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Tear everything down: relay, subscriptions, timers, fallback, and
    /// local game state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the sync loop has exited.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Drop any stale relay and reconnect after a short debounce, bypassing
    /// the attempt cap.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Shutdown`] if the sync loop has exited.
    pub fn manual_reconnect(&self) -> Result<()> {
        self.send(Command::ManualReconnect)
    }

    // ── Channel and game actions ────────────────────────────────────

    /// Subscribe to lobby updates and fetch the current game list.
    ///
    /// # Errors
    ///
    /// [`SyncError::RateLimitExceeded`] or [`SyncError::Channel`].
    pub async fn subscribe_to_lobby(&self) -> Result<()> {
        self.request(|reply| Command::SubscribeLobby { reply }).await
    }

    /// Subscribe to `username`'s private channel and fetch their stats.
    ///
    /// # Errors
    ///
    /// [`SyncError::RateLimitExceeded`] or [`SyncError::Channel`].
    pub async fn subscribe_to_user(&self, username: impl Into<String>) -> Result<()> {
        let username = username.into();
        self.request(|reply| Command::SubscribeUser { username, reply })
            .await
    }

    /// Join a game and load its state and chat log. Any previously joined
    /// game is left first, and its state is cleared before the new one loads.
    ///
    /// # Errors
    ///
    /// [`SyncError::RateLimitExceeded`], [`SyncError::Channel`],
    /// [`SyncError::Http`], or [`SyncError::Superseded`] if another join or
    /// leave happened first.
    pub async fn join_game(
        &self,
        game_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Result<Game> {
        let game_id = game_id.into();
        let username = username.into();
        self.request(|reply| Command::JoinGame {
            game_id,
            username,
            reply,
        })
        .await
    }

    /// Leave the joined game. A no-op when no game is joined.
    ///
    /// # Errors
    ///
    /// [`SyncError::Channel`] if the relay failed to release the channel.
    /// Local state is cleared regardless.
    pub async fn leave_game(&self) -> Result<()> {
        self.request(|reply| Command::LeaveGame { reply }).await
    }

    /// Create a new game. The result shows up through the lobby channel.
    ///
    /// # Errors
    ///
    /// [`SyncError::Http`] if the request fails.
    pub async fn create_game(&self, username: impl Into<String>) -> Result<Game> {
        let username = username.into();
        self.request(|reply| Command::CreateGame { username, reply })
            .await
    }

    /// Submit a move in the joined game.
    ///
    /// Local state is not touched; the new board arrives through the relay
    /// or the next poll.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotInGame`] or [`SyncError::Http`].
    pub async fn make_move(&self, position: usize) -> Result<()> {
        self.request(|reply| Command::MakeMove { position, reply })
            .await
    }

    /// Send a chat line to the joined game.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotInGame`], [`SyncError::RateLimitExceeded`], or
    /// [`SyncError::Http`].
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.request(|reply| Command::SendChat { message, reply })
            .await
    }

    /// Disconnect and stop the sync loop, aborting it if it does not exit
    /// within the configured shutdown timeout.
    pub async fn shutdown(&mut self) {
        debug!("SyncClient: shutdown requested");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("sync loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("sync loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("sync loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The latest published snapshot.
    pub fn view(&self) -> SyncView {
        self.view_rx.borrow().clone()
    }

    /// A fresh receiver for snapshots.
    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.view_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.view_rx.borrow().is_connected
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.view_rx.borrow().is_fallback_mode
    }

    /// Identifier carried in heartbeat payloads.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| SyncError::Shutdown)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view_rx.borrow();
        f.debug_struct("SyncClient")
            .field("session_id", &self.session_id)
            .field("connection_state", &view.connection_state)
            .field("fallback", &view.is_fallback_mode)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // No executor to drive a graceful relay close from `Drop`.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Sync loop ───────────────────────────────────────────────────────

struct SyncLoop {
    session_id: Uuid,
    config: SyncConfig,
    connector: Box<dyn RelayConnector>,
    api: Arc<dyn GameApi>,
    config_source: Arc<dyn ConfigSource>,
    relay: Option<Box<dyn RelayClient>>,
    machine: ConnectionStateMachine,
    registry: ChannelRegistry,
    bridge: SyncBridge,
    limiter: RateLimiter,
    config_cache: ConfigCache,
    /// Channels to (re)subscribe whenever the relay connects. The joined
    /// game lives in the bridge.
    want_lobby: bool,
    want_user: Option<String>,
    /// Bumped on every attempt; stale config fetches are discarded.
    attempt_id: u64,
    channel_error: Option<String>,
    heartbeat_seq: u64,
    connect_timer: Timer,
    retry_timer: Timer,
    heartbeat_timer: Timer,
    grace_timer: Timer,
    poll_timer: Timer,
    manual_timer: Timer,
    internal_tx: mpsc::UnboundedSender<Internal>,
    view_tx: watch::Sender<SyncView>,
}

impl SyncLoop {
    /// Exits when the handle is dropped or shutdown is signalled.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("sync loop started");
        self.publish_view();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, shutting down sync loop");
                        break;
                    }
                },

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }

                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,

                event = next_relay_event(&mut self.relay) => self.handle_relay_event(event).await,

                () = self.connect_timer.fired() => {
                    self.connect_timer.cancel();
                    warn!(timeout = ?self.config.connect_timeout, "connection attempt timed out");
                    let effects = self.machine.timeout_elapsed(self.config.connect_timeout);
                    self.run_effects(effects).await;
                }

                () = self.retry_timer.fired() => {
                    self.retry_timer.cancel();
                    debug!("retry timer fired");
                    self.start_connect().await;
                }

                () = self.manual_timer.fired() => {
                    self.manual_timer.cancel();
                    self.start_connect().await;
                }

                () = self.grace_timer.fired() => {
                    self.grace_timer.cancel();
                    let effects = self.machine.grace_elapsed();
                    self.run_effects(effects).await;
                }

                () = self.heartbeat_timer.fired() => {
                    self.heartbeat_timer.cancel();
                    self.send_heartbeat().await;
                }

                () = self.poll_timer.fired() => {
                    self.poll_timer.cancel();
                    self.poll_tick();
                }
            }

            self.publish_view();
        }

        self.teardown_relay(true).await;
        let _ = self.machine.reset();
        self.publish_view();
        debug!("sync loop exited");
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.start_connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::ManualReconnect => {
                let effects = self.machine.manual_reconnect();
                self.attempt_id += 1;
                self.run_effects(effects).await;
            }
            Command::JoinGame {
                game_id,
                username,
                reply,
            } => self.join_game(game_id, username, reply).await,
            Command::LeaveGame { reply } => {
                let result = self.leave_game().await;
                let _ = reply.send(result);
            }
            Command::SubscribeLobby { reply } => {
                let result = self.subscribe_lobby().await;
                let _ = reply.send(result);
            }
            Command::SubscribeUser { username, reply } => {
                let result = self.subscribe_user(username).await;
                let _ = reply.send(result);
            }
            Command::CreateGame { username, reply } => {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let _ = reply.send(api.create_game(&username).await);
                });
            }
            Command::MakeMove { position, reply } => {
                let Some(joined) = self.bridge.joined().cloned() else {
                    let _ = reply.send(Err(SyncError::NotInGame));
                    return;
                };
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let result = api
                        .make_move(&joined.game_id, &joined.username, position)
                        .await
                        .map(|_| ());
                    let _ = reply.send(result);
                });
            }
            Command::SendChat { message, reply } => {
                let Some(joined) = self.bridge.joined().cloned() else {
                    let _ = reply.send(Err(SyncError::NotInGame));
                    return;
                };
                if !self.limiter.allow_rule(rules::CHAT_SEND) {
                    let _ = reply.send(Err(rate_limited(rules::CHAT_SEND)));
                    return;
                }
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let result = api
                        .send_chat(&joined.game_id, &joined.username, &message)
                        .await;
                    let _ = reply.send(result);
                });
            }
        }
    }

    async fn start_connect(&mut self) {
        let Some(effects) = self.machine.begin_connect(Instant::now()) else {
            return;
        };
        self.attempt_id += 1;
        let attempt = self.attempt_id;
        self.teardown_relay(false).await;
        self.run_effects(effects).await;
        info!(attempt, "connecting to relay");

        match self.config_cache.cached() {
            Some(credentials) => self.open_relay(credentials).await,
            None => {
                let source = Arc::clone(&self.config_source);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = source.fetch_config().await;
                    let _ = tx.send(Internal::ConfigFetched { attempt, result });
                });
            }
        }
    }

    async fn open_relay(&mut self, credentials: RelayCredentials) {
        let mut relay = self.connector.create(&credentials);
        match relay.connect().await {
            Ok(()) => self.relay = Some(relay),
            Err(e) => self.fail_attempt(e).await,
        }
    }

    async fn fail_attempt(&mut self, error: SyncError) {
        warn!(error = %error, "relay connection attempt failed");
        let effects = self.machine.on_failed(&error);
        self.run_effects(effects).await;
    }

    async fn disconnect(&mut self) {
        info!("disconnecting");
        self.teardown_relay(true).await;
        let effects = self.machine.reset();
        self.run_effects(effects).await;
        self.poll_timer.cancel();
        self.manual_timer.cancel();
        self.attempt_id += 1;
        self.want_lobby = false;
        self.want_user = None;
        self.channel_error = None;
        self.bridge.reset();
    }

    async fn join_game(&mut self, game_id: String, username: String, reply: Reply<Game>) {
        if !self.limiter.allow_rule(rules::GAME_JOIN) {
            let _ = reply.send(Err(rate_limited(rules::GAME_JOIN)));
            return;
        }

        if let Some(previous) = self.bridge.joined().cloned() {
            if previous.game_id != game_id {
                if let Err(e) = self.leave_game().await {
                    warn!(game_id = %previous.game_id, "leaving previous game failed: {e}");
                }
            }
        }

        let generation = self.bridge.begin_join(&game_id, &username);
        info!(%game_id, generation, "joining game");
        if let Err(e) = self.subscribe_now(&ChannelKind::Game(game_id.clone())).await {
            self.bridge.leave();
            let _ = reply.send(Err(e));
            return;
        }

        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let game = api.join_game(&game_id, &username).await?;
                let chat = api.get_chat(&game_id).await?;
                Ok::<_, SyncError>((game, chat))
            }
            .await;
            let _ = tx.send(Internal::JoinFetched {
                generation,
                result,
                reply,
            });
        });
    }

    async fn leave_game(&mut self) -> Result<()> {
        let Some(joined) = self.bridge.leave() else {
            debug!("leave requested with no game joined");
            return Ok(());
        };
        info!(game_id = %joined.game_id, "leaving game");
        let released = self
            .unsubscribe_now(&ChannelKind::Game(joined.game_id.clone()))
            .await;

        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.leave_game(&joined.game_id, &joined.username).await {
                warn!(game_id = %joined.game_id, "leave request failed: {e}");
            }
        });
        released
    }

    async fn subscribe_lobby(&mut self) -> Result<()> {
        if !self.limiter.allow_rule(rules::LOBBY_SUBSCRIBE) {
            return Err(rate_limited(rules::LOBBY_SUBSCRIBE));
        }
        self.want_lobby = true;
        if let Err(e) = self.subscribe_now(&ChannelKind::Lobby).await {
            self.want_lobby = false;
            return Err(e);
        }
        let api = Arc::clone(&self.api);
        self.spawn_fetch(SyncSource::Fetch, None, async move {
            api.list_games().await.map(SyncUpdate::LobbyReplaced)
        });
        Ok(())
    }

    async fn subscribe_user(&mut self, username: String) -> Result<()> {
        if !self.limiter.allow_rule(rules::USER_SUBSCRIBE) {
            return Err(rate_limited(rules::USER_SUBSCRIBE));
        }
        if let Some(previous) = self.want_user.take() {
            if previous != username {
                if let Err(e) = self.unsubscribe_now(&ChannelKind::User(previous)).await {
                    warn!("releasing previous user channel failed: {e}");
                }
            }
        }
        self.want_user = Some(username.clone());
        self.bridge.set_stats_user(&username);
        if let Err(e) = self
            .subscribe_now(&ChannelKind::User(username.clone()))
            .await
        {
            self.want_user = None;
            return Err(e);
        }
        let api = Arc::clone(&self.api);
        self.spawn_fetch(SyncSource::Fetch, None, async move {
            api.get_stats(&username).await.map(SyncUpdate::StatsReplaced)
        });
        Ok(())
    }

    // ── Internal results ────────────────────────────────────────────

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ConfigFetched { attempt, result } => {
                if attempt != self.attempt_id
                    || self.machine.state() != ConnectionState::Connecting
                {
                    debug!(attempt, "discarding config for an abandoned attempt");
                    return;
                }
                match result {
                    Ok(credentials) => {
                        self.config_cache.store(credentials.clone());
                        self.open_relay(credentials).await;
                    }
                    Err(SyncError::Config(message)) => {
                        self.fail_attempt(SyncError::Config(message)).await;
                    }
                    Err(other) => self.fail_attempt(SyncError::Config(other.to_string())).await,
                }
            }
            Internal::JoinFetched {
                generation,
                result,
                reply,
            } => {
                if !self.bridge.is_current(generation) {
                    debug!(generation, "discarding join result superseded by a newer join");
                    let _ = reply.send(Err(SyncError::Superseded));
                    return;
                }
                match result {
                    Ok((game, chat)) => {
                        self.bridge.apply(SyncUpdate::GameReplaced(game.clone()));
                        self.bridge.apply(SyncUpdate::ChatReplaced {
                            game_id: game.id.clone(),
                            messages: chat,
                        });
                        let _ = reply.send(Ok(game));
                    }
                    Err(e) => {
                        warn!("join failed, rolling back: {e}");
                        if let Some(joined) = self.bridge.leave() {
                            if let Err(e) =
                                self.unsubscribe_now(&ChannelKind::Game(joined.game_id)).await
                            {
                                debug!("rollback unsubscribe failed: {e}");
                            }
                        }
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Internal::Fetched {
                source,
                generation,
                result,
            } => {
                if source == SyncSource::Poll && !self.bridge.is_fallback() {
                    debug!("discarding poll result after fallback ended");
                    return;
                }
                if let Some(generation) = generation {
                    if !self.bridge.is_current(generation) {
                        debug!(generation, "discarding result for a previous game");
                        return;
                    }
                }
                match result {
                    Ok(update) => {
                        let changed = self.bridge.apply(update);
                        trace!(?source, changed, "applied fetched update");
                    }
                    Err(e) => warn!(?source, "fetch failed: {e}"),
                }
            }
        }
    }

    // ── Relay events ────────────────────────────────────────────────

    async fn handle_relay_event(&mut self, event: Option<RelayEvent>) {
        match event {
            None => {
                debug!("relay event stream ended");
                self.relay = None;
                self.registry.forget_all();
                let effects = self.machine.on_disconnected(Some("relay closed"));
                self.run_effects(effects).await;
            }
            Some(RelayEvent::State(state)) => self.handle_relay_state(state).await,
            Some(RelayEvent::Message {
                channel,
                event,
                data,
            }) => {
                let Some(subscription) = self.registry.resolve(&channel, &event) else {
                    trace!(%channel, %event, "event for an unbound channel or event");
                    return;
                };
                let kind = subscription.kind.clone();
                match self.bridge.apply_event(&kind, &event, data) {
                    Ok(changed) => trace!(source = ?SyncSource::Relay, %channel, %event, changed, "applied relay event"),
                    Err(e) => warn!(%channel, %event, "{e}"),
                }
            }
            Some(RelayEvent::SubscriptionFailed { channel, reason }) => {
                self.subscription_rejected(channel, reason).await;
            }
        }
    }

    async fn handle_relay_state(&mut self, state: RelayState) {
        let effects = match state {
            RelayState::Connecting => {
                debug!("relay connecting");
                return;
            }
            RelayState::Connected => self.machine.on_connected(),
            RelayState::Disconnected { reason } => self.machine.on_disconnected(reason.as_deref()),
            RelayState::Suspended { reason } => self.machine.on_suspended(reason.as_deref()),
            RelayState::Failed { reason } => {
                self.fail_attempt(SyncError::Connection(reason)).await;
                return;
            }
        };
        self.run_effects(effects).await;
    }

    /// Roll back a subscription the relay refused so the next subscribe
    /// request for the channel starts over.
    async fn subscription_rejected(&mut self, channel: String, reason: String) {
        let error = SyncError::Channel {
            channel: channel.clone(),
            message: reason,
        };
        warn!("{error}");
        if let Some(relay) = self.relay.as_deref_mut() {
            if let Err(e) = self.registry.unsubscribe(relay, &channel).await {
                debug!(%channel, "releasing rejected channel failed: {e}");
            }
        }
        self.channel_error = Some(error.to_string());
    }

    // ── Effects ─────────────────────────────────────────────────────

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmConnectTimeout => self.connect_timer.arm(self.config.connect_timeout),
                Effect::ClearConnectTimeout => self.connect_timer.cancel(),
                Effect::StartHeartbeat => self.heartbeat_timer.arm(self.config.heartbeat_interval),
                Effect::StopHeartbeat => self.heartbeat_timer.cancel(),
                Effect::ArmGracePeriod => self.grace_timer.arm(self.config.disconnect_grace),
                Effect::ClearGracePeriod => self.grace_timer.cancel(),
                Effect::ScheduleRetry(delay) => self.retry_timer.arm(delay),
                Effect::CancelRetry => self.retry_timer.cancel(),
                Effect::ArmManualReconnect => {
                    self.manual_timer.arm(self.config.manual_reconnect_delay);
                }
                Effect::EnterFallback => {
                    if self.bridge.set_fallback(true) {
                        warn!("relay unavailable, falling back to polling");
                        self.poll_timer.arm(Duration::ZERO);
                    }
                }
                Effect::ExitFallback => {
                    if self.bridge.set_fallback(false) {
                        info!("relay restored, polling stopped");
                    }
                    self.poll_timer.cancel();
                }
                Effect::ReleaseRelay => self.teardown_relay(false).await,
                Effect::Resubscribe => self.resubscribe().await,
            }
        }
    }

    /// Drop the relay client. A graceful teardown releases each channel
    /// first; otherwise the registry just forgets the dead handles.
    async fn teardown_relay(&mut self, graceful: bool) {
        let Some(mut relay) = self.relay.take() else {
            self.registry.forget_all();
            return;
        };
        if graceful {
            self.registry.unsubscribe_all(&mut *relay).await;
        } else {
            self.registry.forget_all();
        }
        if let Err(e) = relay.disconnect().await {
            debug!("relay disconnect failed: {e}");
        }
    }

    async fn resubscribe(&mut self) {
        let mut wanted = Vec::new();
        if self.want_lobby {
            wanted.push(ChannelKind::Lobby);
        }
        if let Some(joined) = self.bridge.joined() {
            wanted.push(ChannelKind::Game(joined.game_id.clone()));
        }
        if let Some(user) = &self.want_user {
            wanted.push(ChannelKind::User(user.clone()));
        }
        let Some(relay) = self.relay.as_deref_mut() else {
            return;
        };
        for kind in wanted {
            if let Err(e) = self.registry.subscribe(relay, &kind).await {
                warn!(channel = %kind.channel_name(), "resubscribe failed: {e}");
            }
        }
    }

    /// Subscribe right away if connected; otherwise the channel is picked up
    /// by the next resubscribe.
    async fn subscribe_now(&mut self, kind: &ChannelKind) -> Result<()> {
        if self.machine.state() != ConnectionState::Connected {
            debug!(channel = %kind.channel_name(), "not connected, subscription deferred");
            return Ok(());
        }
        let Some(relay) = self.relay.as_deref_mut() else {
            return Ok(());
        };
        let fresh = !self.registry.contains(&kind.channel_name());
        self.registry.subscribe(relay, kind).await?;
        if fresh {
            self.channel_error = None;
        }
        Ok(())
    }

    async fn unsubscribe_now(&mut self, kind: &ChannelKind) -> Result<()> {
        let name = kind.channel_name();
        match self.relay.as_deref_mut() {
            Some(relay) => self.registry.unsubscribe(relay, &name).await,
            None => Ok(()),
        }
    }

    async fn send_heartbeat(&mut self) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        self.heartbeat_timer.arm(self.config.heartbeat_interval);
        self.heartbeat_seq += 1;
        let heartbeat = Heartbeat {
            session_id: self.session_id,
            sequence: self.heartbeat_seq,
        };
        let payload = match serde_json::to_value(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode heartbeat: {e}");
                return;
            }
        };
        if let Some(relay) = self.relay.as_mut() {
            if let Err(e) = relay
                .publish(HEARTBEAT_CHANNEL, events::HEARTBEAT, payload)
                .await
            {
                debug!(sequence = heartbeat.sequence, "heartbeat publish failed: {e}");
            }
        }
    }

    // ── Fallback polling ────────────────────────────────────────────

    fn poll_tick(&mut self) {
        if !self.bridge.is_fallback() {
            return;
        }
        self.poll_timer.arm(self.config.poll_interval);
        if self.machine.is_manual_pending() {
            debug!("manual reconnect pending, skipping poll");
            return;
        }

        if self.want_lobby && self.poll_allowed(rules::POLL_GAMES) {
            let api = Arc::clone(&self.api);
            self.spawn_fetch(SyncSource::Poll, None, async move {
                api.list_games().await.map(SyncUpdate::LobbyReplaced)
            });
        }

        if let Some(joined) = self.bridge.joined().cloned() {
            if self.poll_allowed(rules::POLL_GAME) {
                let api = Arc::clone(&self.api);
                let game_id = joined.game_id.clone();
                self.spawn_fetch(SyncSource::Poll, Some(joined.generation), async move {
                    api.get_game(&game_id).await.map(SyncUpdate::GameReplaced)
                });
            }
            if self.poll_allowed(rules::POLL_CHAT) {
                let api = Arc::clone(&self.api);
                let game_id = joined.game_id;
                self.spawn_fetch(SyncSource::Poll, Some(joined.generation), async move {
                    let messages = api.get_chat(&game_id).await?;
                    Ok::<_, SyncError>(SyncUpdate::ChatReplaced { game_id, messages })
                });
            }
        }

        if let Some(username) = self.want_user.clone() {
            if self.poll_allowed(rules::POLL_STATS) {
                let api = Arc::clone(&self.api);
                self.spawn_fetch(SyncSource::Poll, None, async move {
                    api.get_stats(&username).await.map(SyncUpdate::StatsReplaced)
                });
            }
        }
    }

    fn poll_allowed(&mut self, rule: RateRule) -> bool {
        let allowed = self.limiter.allow_rule(rule);
        if !allowed {
            debug!(action = rule.action, "poll skipped by rate limit");
        }
        allowed
    }

    fn spawn_fetch<F>(&self, source: SyncSource, generation: Option<u64>, fetch: F)
    where
        F: Future<Output = Result<SyncUpdate>> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetch.await;
            let _ = tx.send(Internal::Fetched {
                source,
                generation,
                result,
            });
        });
    }

    // ── View ────────────────────────────────────────────────────────

    fn publish_view(&self) {
        let state = self.machine.state();
        let view = SyncView {
            connection_state: state,
            is_connected: state == ConnectionState::Connected,
            is_initializing: state == ConnectionState::Connecting,
            connection_error: self.machine.last_error().map(str::to_string),
            channel_error: self.channel_error.clone(),
            is_fallback_mode: self.bridge.is_fallback(),
            reconnect_attempts: self.machine.attempt().count,
            games: self.bridge.games().to_vec(),
            current_game: self.bridge.current_game().cloned(),
            chat_messages: self.bridge.chat_messages().to_vec(),
            player_stats: self.bridge.player_stats().cloned(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

/// Next event from the relay, or never while there is none.
async fn next_relay_event(relay: &mut Option<Box<dyn RelayClient>>) -> Option<RelayEvent> {
    match relay {
        Some(relay) => relay.next_event().await,
        None => std::future::pending().await,
    }
}

fn rate_limited(rule: RateRule) -> SyncError {
    warn!(action = rule.action, limit = rule.limit, "rate limit exceeded");
    SyncError::RateLimitExceeded {
        action: rule.action.to_string(),
    }
}
