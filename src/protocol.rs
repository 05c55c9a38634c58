//! Channel names, event names, and the JSON payloads carried on them.
//!
//! Channel and event names are the only protocol surface shared between the
//! server-side publisher and this client, so they are fixed string constants
//! here and nowhere else. Payloads use the server's camelCase JSON shape.
//!
//! Every inbound payload, whether it came from a relay event or from a poll
//! response, is decoded into a [`SyncUpdate`] before it touches local state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

// ── Identifiers ─────────────────────────────────────────────────────

/// Server-assigned game identifier.
pub type GameId = String;

// ── Channel and event names ─────────────────────────────────────────

/// Channel carrying lobby-wide game list changes.
pub const LOBBY_CHANNEL: &str = "lobby";

/// Channel the keepalive heartbeat is published to.
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

/// Prefix of per-game channels (`game-<id>`).
pub const GAME_CHANNEL_PREFIX: &str = "game-";

/// Prefix of per-user channels (`user-<username>`).
pub const USER_CHANNEL_PREFIX: &str = "user-";

/// Event names published by the server.
pub mod events {
    pub const GAMES_UPDATED: &str = "games-updated";
    pub const GAME_CREATED: &str = "game-created";
    pub const GAME_REMOVED: &str = "game-removed";
    pub const GAME_UPDATED: &str = "game-updated";
    pub const PLAYER_JOINED: &str = "player-joined";
    pub const PLAYER_LEFT: &str = "player-left";
    pub const PLAYER_MOVED: &str = "player-moved";
    pub const GAME_ENDED: &str = "game-ended";
    pub const CHAT_MESSAGE: &str = "chat-message";
    pub const STATS_UPDATED: &str = "stats-updated";
    /// Client-published keepalive; never bound by any subscription.
    pub const HEARTBEAT: &str = "client-heartbeat";
}

/// Events bound on the lobby channel.
pub const LOBBY_EVENTS: &[&str] = &[
    events::GAMES_UPDATED,
    events::GAME_CREATED,
    events::GAME_REMOVED,
    events::GAME_UPDATED,
];

/// Events bound on a per-game channel.
pub const GAME_EVENTS: &[&str] = &[
    events::GAME_UPDATED,
    events::PLAYER_JOINED,
    events::PLAYER_LEFT,
    events::PLAYER_MOVED,
    events::GAME_ENDED,
    events::CHAT_MESSAGE,
    events::STATS_UPDATED,
];

/// Events bound on a per-user channel.
pub const USER_EVENTS: &[&str] = &[events::STATS_UPDATED];

/// The three classes of channel this client subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The shared lobby channel.
    Lobby,
    /// The channel of one game.
    Game(GameId),
    /// The private channel of one user.
    User(String),
}

impl ChannelKind {
    /// Relay channel name for this kind.
    pub fn channel_name(&self) -> String {
        match self {
            Self::Lobby => LOBBY_CHANNEL.to_string(),
            Self::Game(id) => format!("{GAME_CHANNEL_PREFIX}{id}"),
            Self::User(name) => format!("{USER_CHANNEL_PREFIX}{name}"),
        }
    }

    /// The fixed set of events bound when this channel is subscribed.
    pub fn events(&self) -> &'static [&'static str] {
        match self {
            Self::Lobby => LOBBY_EVENTS,
            Self::Game(_) => GAME_EVENTS,
            Self::User(_) => USER_EVENTS,
        }
    }

    /// Recover the kind from a channel name. Returns `None` for foreign channels.
    pub fn from_channel_name(name: &str) -> Option<Self> {
        if name == LOBBY_CHANNEL {
            return Some(Self::Lobby);
        }
        if let Some(id) = name.strip_prefix(GAME_CHANNEL_PREFIX) {
            return (!id.is_empty()).then(|| Self::Game(id.to_string()));
        }
        if let Some(user) = name.strip_prefix(USER_CHANNEL_PREFIX) {
            return (!user.is_empty()).then(|| Self::User(user.to_string()));
        }
        None
    }
}

// ── Game state ──────────────────────────────────────────────────────

/// A mark placed on the board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mark {
    X,
    O,
}

/// Number of cells on a 3x3 board.
pub const BOARD_CELLS: usize = 9;

/// A 3x3 board in row-major order. Deserialization rejects any other length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Option<Mark>>", into = "Vec<Option<Mark>>")]
pub struct Board([Option<Mark>; BOARD_CELLS]);

impl Board {
    /// Create a board from row-major cells.
    pub fn new(cells: [Option<Mark>; BOARD_CELLS]) -> Self {
        Self(cells)
    }

    /// All cells in row-major order.
    pub fn cells(&self) -> &[Option<Mark>; BOARD_CELLS] {
        &self.0
    }

    /// The mark at `index`, or `None` for an empty or out-of-range cell.
    pub fn get(&self, index: usize) -> Option<Mark> {
        self.0.get(index).copied().flatten()
    }

    /// Returns `true` if no cell is marked.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

impl TryFrom<Vec<Option<Mark>>> for Board {
    type Error = String;

    fn try_from(cells: Vec<Option<Mark>>) -> std::result::Result<Self, Self::Error> {
        let len = cells.len();
        let cells: [Option<Mark>; BOARD_CELLS] = cells
            .try_into()
            .map_err(|_| format!("board must have {BOARD_CELLS} cells, got {len}"))?;
        Ok(Self(cells))
    }
}

impl From<Board> for Vec<Option<Mark>> {
    fn from(board: Board) -> Self {
        board.0.to_vec()
    }
}

/// Lifecycle of a game.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    #[default]
    Waiting,
    Playing,
    Finished,
}

/// Complete server-side state of one game.
///
/// The server always sends the full object, so the client replaces its copy
/// wholesale instead of merging fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: GameId,
    pub board: Board,
    #[serde(default)]
    pub players: Vec<String>,
    /// Username whose turn it is.
    #[serde(default)]
    pub current_turn: Option<String>,
    #[serde(default)]
    pub status: GameStatus,
    #[serde(default)]
    pub winner: Option<String>,
    /// Server modification time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Game {
    /// Returns `true` if `self` is known to be older than `other`.
    ///
    /// Payloads without a timestamp are never considered stale.
    pub fn is_older_than(&self, other: &Game) -> bool {
        match (self.updated_at, other.updated_at) {
            (Some(mine), Some(theirs)) => mine < theirs,
            _ => false,
        }
    }
}

/// A chat line in a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    pub username: String,
    pub message: String,
    /// Send time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Win/loss record of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    pub username: String,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub draws: u32,
}

/// Relay connection credentials returned by `GET /config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredentials {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

/// Inert keepalive payload published on [`HEARTBEAT_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub session_id: Uuid,
    pub sequence: u64,
}

// ── Decoded updates ─────────────────────────────────────────────────

/// A state change decoded from a relay event or a poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    /// Replace the whole lobby list.
    LobbyReplaced(Vec<Game>),
    /// Insert or replace one lobby entry.
    LobbyUpserted(Game),
    /// Remove one lobby entry.
    LobbyRemoved(GameId),
    /// Replace the joined game wholesale.
    GameReplaced(Game),
    /// Append one chat line to the joined game's log.
    ChatAppended(ChatMessage),
    /// Replace the joined game's chat log (poll responses).
    ChatReplaced {
        game_id: GameId,
        messages: Vec<ChatMessage>,
    },
    /// Replace a player's stats.
    StatsReplaced(PlayerStats),
}

/// Lobby list payloads arrive either bare or wrapped in `{"games": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum GameList {
    Bare(Vec<Game>),
    Wrapped { games: Vec<Game> },
}

/// `game-removed` carries only the identifier.
#[derive(Deserialize)]
struct GameRef {
    #[serde(alias = "gameId")]
    id: GameId,
}

impl SyncUpdate {
    /// Decode a relay event received on a channel of `kind`.
    ///
    /// Returns `Ok(None)` for events that are not bound on that channel class.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncApply`] if the payload does not match the
    /// shape the event name promises.
    pub fn from_event(
        kind: &ChannelKind,
        event: &str,
        data: serde_json::Value,
    ) -> Result<Option<Self>> {
        if !kind.events().contains(&event) {
            return Ok(None);
        }
        let update = match (kind, event) {
            (ChannelKind::Lobby, events::GAMES_UPDATED) => {
                let list: GameList = decode(event, data)?;
                Self::LobbyReplaced(match list {
                    GameList::Bare(games) | GameList::Wrapped { games } => games,
                })
            }
            (ChannelKind::Lobby, events::GAME_CREATED | events::GAME_UPDATED) => {
                Self::LobbyUpserted(decode(event, data)?)
            }
            (ChannelKind::Lobby, events::GAME_REMOVED) => {
                let game: GameRef = decode(event, data)?;
                Self::LobbyRemoved(game.id)
            }
            (ChannelKind::Game(_), events::CHAT_MESSAGE) => Self::ChatAppended(decode(event, data)?),
            (ChannelKind::Game(_) | ChannelKind::User(_), events::STATS_UPDATED) => {
                Self::StatsReplaced(decode(event, data)?)
            }
            (ChannelKind::Game(_), _) => Self::GameReplaced(decode(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(update))
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T> {
    // Some relays deliver `data` as a JSON-encoded string.
    let data = match data {
        serde_json::Value::String(text) => serde_json::from_str(&text)
            .map_err(|e| SyncError::SyncApply(format!("{event}: {e}")))?,
        other => other,
    };
    serde_json::from_value(data).map_err(|e| SyncError::SyncApply(format!("{event}: {e}")))
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
    use serde_json::json;

    #[test]
    fn channel_names_round_trip_through_kind() {
        let kind = ChannelKind::Game("42".into());
        assert_eq!(kind.channel_name(), "game-42");
        assert_eq!(ChannelKind::from_channel_name("game-42"), Some(kind));
        assert_eq!(
            ChannelKind::from_channel_name("user-alice"),
            Some(ChannelKind::User("alice".into()))
        );
        assert_eq!(ChannelKind::from_channel_name("lobby"), Some(ChannelKind::Lobby));
        assert_eq!(ChannelKind::from_channel_name("game-"), None);
        assert_eq!(ChannelKind::from_channel_name("presence-x"), None);
    }

    #[test]
    fn board_rejects_wrong_length() {
        let err = serde_json::from_value::<Board>(json!(["X", null])).unwrap_err();
        assert!(err.to_string().contains("9 cells"));
    }

    #[test]
    fn unbound_event_is_ignored() {
        let update =
            SyncUpdate::from_event(&ChannelKind::User("bob".into()), events::CHAT_MESSAGE, json!({}))
                .unwrap();
        assert!(update.is_none());
    }

    #[test]
    fn stringified_payloads_are_decoded() {
        let data = json!(r#"{"username":"bob","wins":3}"#);
        let update =
            SyncUpdate::from_event(&ChannelKind::User("bob".into()), events::STATS_UPDATED, data)
                .unwrap();
        match update {
            Some(SyncUpdate::StatsReplaced(stats)) => {
                assert_eq!(stats.username, "bob");
                assert_eq!(stats.wins, 3);
                assert_eq!(stats.losses, 0);
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn game_removed_accepts_game_id_alias() {
        let update = SyncUpdate::from_event(
            &ChannelKind::Lobby,
            events::GAME_REMOVED,
            json!({"gameId": "7"}),
        )
        .unwrap();
        assert_eq!(update, Some(SyncUpdate::LobbyRemoved("7".into())));
    }

    #[test]
    fn staleness_needs_both_timestamps() {
        let base = Game {
            id: "1".into(),
            board: Board::default(),
            players: vec![],
            current_turn: None,
            status: GameStatus::Playing,
            winner: None,
            updated_at: Some(10),
        };
        let newer = Game {
            updated_at: Some(20),
            ..base.clone()
        };
        let untimed = Game {
            updated_at: None,
            ..base.clone()
        };
        assert!(base.is_older_than(&newer));
        assert!(!newer.is_older_than(&base));
        assert!(!untimed.is_older_than(&newer));
    }
}
