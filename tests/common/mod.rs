#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test doubles for the sync client integration tests.
//!
//! [`MockConnector`] hands out [`MockRelay`]s that record every relay call in
//! a shared [`RelayLog`] and deliver injected events once per live binding,
//! the way a real relay would. [`MockGameApi`] serves games, chat and stats
//! from an in-memory table and counts calls per endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use tictac_sync::protocol::{Board, GameStatus, Mark};
use tictac_sync::relay::{ChannelHandle, RelayClient, RelayConnector, RelayEvent, RelayState};
use tictac_sync::{
    ChatMessage, ConfigSource, Game, GameApi, PlayerStats, RelayCredentials, SyncError, SyncView,
};

// ── Relay double ────────────────────────────────────────────────────

/// How the next created relay responds to `connect`.
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Report `connecting` then `connected`.
    Succeed,
    /// Report `failed` with the given reason.
    Fail(String),
    /// Never report anything.
    Hang,
}

/// Every relay call made across all relays of one connector.
#[derive(Debug, Default)]
pub struct RelayLog {
    pub created: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub subscribes: Vec<String>,
    pub unsubscribes: Vec<String>,
    pub publishes: Vec<(String, String, serde_json::Value)>,
    /// Live `(channel, event)` bindings on the current relay.
    pub bindings: Vec<(String, String)>,
}

struct Shared {
    behavior: ConnectBehavior,
    log: RelayLog,
    current_id: usize,
    current_tx: Option<mpsc::UnboundedSender<RelayEvent>>,
    handles: HashMap<ChannelHandle, String>,
    next_handle: u64,
}

#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<StdMutex<Shared>>,
}

impl MockConnector {
    pub fn new(behavior: ConnectBehavior) -> Self {
        Self {
            shared: Arc::new(StdMutex::new(Shared {
                behavior,
                log: RelayLog::default(),
                current_id: 0,
                current_tx: None,
                handles: HashMap::new(),
                next_handle: 0,
            })),
        }
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.shared.lock().unwrap().behavior = behavior;
    }

    /// Inspect the call log.
    pub fn log<R>(&self, f: impl FnOnce(&RelayLog) -> R) -> R {
        f(&self.shared.lock().unwrap().log)
    }

    /// Push a state change through the current relay.
    pub fn emit_state(&self, state: RelayState) {
        let shared = self.shared.lock().unwrap();
        if let Some(tx) = &shared.current_tx {
            let _ = tx.send(RelayEvent::State(state));
        }
    }

    /// Refuse a subscription after the fact, as a relay does on auth errors.
    /// Bindings on the channel stop receiving, like on a real relay.
    pub fn reject(&self, channel: &str, reason: &str) {
        let mut shared = self.shared.lock().unwrap();
        shared.log.bindings.retain(|(c, _)| c != channel);
        if let Some(tx) = &shared.current_tx {
            let _ = tx.send(RelayEvent::SubscriptionFailed {
                channel: channel.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Deliver `event` once per live binding of `(channel, event)`.
    pub fn deliver(&self, channel: &str, event: &str, data: serde_json::Value) -> usize {
        let shared = self.shared.lock().unwrap();
        let Some(tx) = &shared.current_tx else {
            return 0;
        };
        let copies = shared
            .log
            .bindings
            .iter()
            .filter(|(c, e)| c == channel && e == event)
            .count();
        for _ in 0..copies {
            let _ = tx.send(RelayEvent::Message {
                channel: channel.to_string(),
                event: event.to_string(),
                data: data.clone(),
            });
        }
        copies
    }
}

impl RelayConnector for MockConnector {
    fn create(&self, _credentials: &RelayCredentials) -> Box<dyn RelayClient> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock().unwrap();
        shared.log.created += 1;
        shared.log.bindings.clear();
        shared.current_id = shared.log.created;
        shared.current_tx = Some(tx.clone());
        Box::new(MockRelay {
            id: shared.current_id,
            shared: Arc::clone(&self.shared),
            tx,
            rx,
        })
    }
}

pub struct MockRelay {
    id: usize,
    shared: Arc<StdMutex<Shared>>,
    tx: mpsc::UnboundedSender<RelayEvent>,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn connect(&mut self) -> Result<(), SyncError> {
        let behavior = {
            let mut shared = self.shared.lock().unwrap();
            shared.log.connects += 1;
            shared.behavior.clone()
        };
        match behavior {
            ConnectBehavior::Succeed => {
                let _ = self.tx.send(RelayEvent::State(RelayState::Connecting));
                let _ = self.tx.send(RelayEvent::State(RelayState::Connected));
            }
            ConnectBehavior::Fail(reason) => {
                let _ = self.tx.send(RelayEvent::State(RelayState::Failed { reason }));
            }
            ConnectBehavior::Hang => {}
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SyncError> {
        let mut shared = self.shared.lock().unwrap();
        shared.log.disconnects += 1;
        if shared.current_id == self.id {
            shared.log.bindings.clear();
            shared.current_tx = None;
        }
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<ChannelHandle, SyncError> {
        let mut shared = self.shared.lock().unwrap();
        shared.next_handle += 1;
        let handle = ChannelHandle(shared.next_handle);
        shared.handles.insert(handle, channel.to_string());
        shared.log.subscribes.push(channel.to_string());
        Ok(handle)
    }

    async fn bind(&mut self, handle: ChannelHandle, event: &str) -> Result<(), SyncError> {
        let mut shared = self.shared.lock().unwrap();
        let channel = shared.handles.get(&handle).cloned().unwrap();
        shared.log.bindings.push((channel, event.to_string()));
        Ok(())
    }

    async fn unbind_all(&mut self, handle: ChannelHandle) -> Result<(), SyncError> {
        let mut shared = self.shared.lock().unwrap();
        let channel = shared.handles.get(&handle).cloned().unwrap();
        shared.log.bindings.retain(|(c, _)| *c != channel);
        Ok(())
    }

    async fn unsubscribe(&mut self, handle: ChannelHandle) -> Result<(), SyncError> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(channel) = shared.handles.remove(&handle) {
            shared.log.unsubscribes.push(channel);
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        self.shared.lock().unwrap().log.publishes.push((
            channel.to_string(),
            event.to_string(),
            payload,
        ));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

// ── Game API double ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ApiState {
    pub lobby: Vec<Game>,
    pub games: HashMap<String, Game>,
    pub chat: HashMap<String, Vec<ChatMessage>>,
    pub stats: HashMap<String, PlayerStats>,
    /// Config fetches that fail before one succeeds.
    pub config_failures: u32,
    pub calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub struct MockGameApi {
    state: StdMutex<ApiState>,
}

impl MockGameApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ApiState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.with_state(|s| s.calls.get(endpoint).copied().unwrap_or(0))
    }

    fn record(&self, endpoint: &'static str) {
        self.with_state(|s| *s.calls.entry(endpoint).or_default() += 1);
    }

    fn not_found(what: &str) -> SyncError {
        SyncError::Http {
            status: Some(404),
            message: format!("{what} not found"),
        }
    }
}

#[async_trait]
impl GameApi for MockGameApi {
    async fn create_game(&self, username: &str) -> Result<Game, SyncError> {
        self.record("create_game");
        let game = self.with_state(|s| {
            let id = format!("g{}", s.games.len() + 1);
            let game = Game {
                players: vec![username.to_string()],
                status: GameStatus::Waiting,
                ..game(&id, [None; 9], None)
            };
            s.games.insert(id, game.clone());
            game
        });
        Ok(game)
    }

    async fn join_game(&self, game_id: &str, _username: &str) -> Result<Game, SyncError> {
        self.record("join_game");
        self.with_state(|s| s.games.get(game_id).cloned())
            .ok_or_else(|| Self::not_found(game_id))
    }

    async fn leave_game(&self, _game_id: &str, _username: &str) -> Result<(), SyncError> {
        self.record("leave_game");
        Ok(())
    }

    async fn make_move(
        &self,
        game_id: &str,
        _username: &str,
        _position: usize,
    ) -> Result<Game, SyncError> {
        self.record("make_move");
        self.with_state(|s| s.games.get(game_id).cloned())
            .ok_or_else(|| Self::not_found(game_id))
    }

    async fn send_chat(&self, _game_id: &str, _username: &str, _message: &str) -> Result<(), SyncError> {
        self.record("send_chat");
        Ok(())
    }

    async fn list_games(&self) -> Result<Vec<Game>, SyncError> {
        self.record("list_games");
        Ok(self.with_state(|s| s.lobby.clone()))
    }

    async fn get_game(&self, game_id: &str) -> Result<Game, SyncError> {
        self.record("get_game");
        self.with_state(|s| s.games.get(game_id).cloned())
            .ok_or_else(|| Self::not_found(game_id))
    }

    async fn get_chat(&self, game_id: &str) -> Result<Vec<ChatMessage>, SyncError> {
        self.record("get_chat");
        Ok(self.with_state(|s| s.chat.get(game_id).cloned().unwrap_or_default()))
    }

    async fn get_stats(&self, username: &str) -> Result<PlayerStats, SyncError> {
        self.record("get_stats");
        self.with_state(|s| s.stats.get(username).cloned())
            .ok_or_else(|| Self::not_found(username))
    }
}

#[async_trait]
impl ConfigSource for MockGameApi {
    async fn fetch_config(&self) -> Result<RelayCredentials, SyncError> {
        self.record("fetch_config");
        let fail = self.with_state(|s| {
            if s.config_failures > 0 {
                s.config_failures -= 1;
                true
            } else {
                false
            }
        });
        if fail {
            return Err(SyncError::Config("config endpoint unreachable".into()));
        }
        Ok(RelayCredentials {
            key: "test-key".into(),
            cluster: Some("eu".into()),
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

/// A two-player game in progress.
pub fn game(id: &str, board: [Option<Mark>; 9], updated_at: Option<i64>) -> Game {
    Game {
        id: id.to_string(),
        board: Board::new(board),
        players: vec!["ann".into(), "bob".into()],
        current_turn: Some("ann".into()),
        status: GameStatus::Playing,
        winner: None,
        updated_at,
    }
}

pub fn chat(game_id: &str, username: &str, message: &str) -> ChatMessage {
    ChatMessage {
        game_id: Some(game_id.to_string()),
        username: username.to_string(),
        message: message.to_string(),
        timestamp: None,
    }
}

/// Wait (in virtual time) until the view satisfies `pred`, and return it.
pub async fn wait_view(
    view: &mut watch::Receiver<SyncView>,
    pred: impl FnMut(&SyncView) -> bool,
) -> SyncView {
    tokio::time::timeout(Duration::from_secs(3600), view.wait_for(pred))
        .await
        .expect("view never reached the expected state")
        .expect("sync loop exited")
        .clone()
}
