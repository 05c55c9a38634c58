//! Local mirror of server state.
//!
//! [`SyncBridge`] is the single writer of the lobby list, the joined game,
//! its chat log, and the player's stats. Relay events and poll responses go
//! through the same [`SyncBridge::apply`], so fallback polling and live
//! updates can never disagree about how a payload is interpreted.
//!
//! Joining or leaving a game bumps a generation counter. Fetches started for
//! an older generation are discarded when they complete, which keeps a slow
//! response for a previous game from showing up after a switch.

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::{ChannelKind, ChatMessage, Game, GameId, PlayerStats, SyncUpdate};

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// A relay event.
    Relay,
    /// The periodic fallback poll.
    Poll,
    /// A one-off fetch triggered by a subscribe or join.
    Fetch,
}

/// The game the user currently sits in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedGame {
    pub game_id: GameId,
    pub username: String,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct SyncBridge {
    games: Vec<Game>,
    current_game: Option<Game>,
    chat: Vec<ChatMessage>,
    player_stats: Option<PlayerStats>,
    stats_user: Option<String>,
    joined: Option<JoinedGame>,
    generation: u64,
    fallback: bool,
}

impl SyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a relay event for a channel of `kind` and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncApply`](crate::SyncError::SyncApply) for a
    /// malformed payload. Local state is left untouched in that case.
    pub fn apply_event(
        &mut self,
        kind: &ChannelKind,
        event: &str,
        data: serde_json::Value,
    ) -> Result<bool> {
        match SyncUpdate::from_event(kind, event, data)? {
            Some(update) => Ok(self.apply(update)),
            None => {
                trace!(?kind, event, "event has no state mapping");
                Ok(false)
            }
        }
    }

    /// Apply one decoded update. Returns `true` if local state changed.
    ///
    /// Updates for a game other than the joined one, and game payloads older
    /// than the copy already held, are dropped.
    pub fn apply(&mut self, update: SyncUpdate) -> bool {
        match update {
            SyncUpdate::LobbyReplaced(games) => {
                if self.games == games {
                    return false;
                }
                self.games = games;
                true
            }
            SyncUpdate::LobbyUpserted(game) => {
                match self.games.iter_mut().find(|g| g.id == game.id) {
                    Some(existing) if game.is_older_than(existing) || *existing == game => false,
                    Some(existing) => {
                        *existing = game;
                        true
                    }
                    None => {
                        self.games.push(game);
                        true
                    }
                }
            }
            SyncUpdate::LobbyRemoved(id) => {
                let before = self.games.len();
                self.games.retain(|g| g.id != id);
                self.games.len() != before
            }
            SyncUpdate::GameReplaced(game) => self.replace_game(game),
            SyncUpdate::ChatAppended(message) => {
                let Some(joined) = &self.joined else {
                    debug!("dropping chat line: no game joined");
                    return false;
                };
                if message.game_id.as_ref().is_some_and(|id| *id != joined.game_id) {
                    debug!(game_id = ?message.game_id, "dropping chat line for another game");
                    return false;
                }
                self.chat.push(message);
                true
            }
            SyncUpdate::ChatReplaced { game_id, messages } => {
                if !self.is_joined(&game_id) {
                    debug!(%game_id, "dropping chat log for a game not joined");
                    return false;
                }
                if self.chat == messages {
                    return false;
                }
                self.chat = messages;
                true
            }
            SyncUpdate::StatsReplaced(stats) => {
                if self.stats_user.as_deref() != Some(stats.username.as_str()) {
                    trace!(username = %stats.username, "ignoring stats for another player");
                    return false;
                }
                if self.player_stats.as_ref() == Some(&stats) {
                    return false;
                }
                self.player_stats = Some(stats);
                true
            }
        }
    }

    fn replace_game(&mut self, game: Game) -> bool {
        if !self.is_joined(&game.id) {
            debug!(game_id = %game.id, "dropping state for a game not joined");
            return false;
        }
        if let Some(current) = &self.current_game {
            if game.is_older_than(current) {
                warn!(
                    game_id = %game.id,
                    incoming = ?game.updated_at,
                    held = ?current.updated_at,
                    "dropping stale game state"
                );
                return false;
            }
            if *current == game {
                return false;
            }
        }
        self.current_game = Some(game);
        true
    }

    /// Start a join. Clears the previous game's state and returns the new
    /// generation.
    pub fn begin_join(&mut self, game_id: &str, username: &str) -> u64 {
        self.clear_game();
        self.generation += 1;
        self.joined = Some(JoinedGame {
            game_id: game_id.to_string(),
            username: username.to_string(),
            generation: self.generation,
        });
        self.generation
    }

    /// Leave the joined game, if any, clearing its state.
    pub fn leave(&mut self) -> Option<JoinedGame> {
        let previous = self.joined.take();
        if previous.is_some() {
            self.generation += 1;
        }
        self.clear_game();
        previous
    }

    /// Whether a fetch started at `generation` may still be applied.
    pub fn is_current(&self, generation: u64) -> bool {
        self.joined
            .as_ref()
            .is_some_and(|joined| joined.generation == generation)
    }

    fn is_joined(&self, game_id: &str) -> bool {
        self.joined
            .as_ref()
            .is_some_and(|joined| joined.game_id == game_id)
    }

    fn clear_game(&mut self) {
        self.current_game = None;
        self.chat.clear();
    }

    /// Track stats for `username`. Switching users drops the old stats.
    pub fn set_stats_user(&mut self, username: &str) {
        if self.stats_user.as_deref() != Some(username) {
            self.player_stats = None;
            self.stats_user = Some(username.to_string());
        }
    }

    /// Set fallback mode. Returns `true` if the flag changed.
    pub fn set_fallback(&mut self, enabled: bool) -> bool {
        let changed = self.fallback != enabled;
        self.fallback = enabled;
        changed
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Forget everything: lobby, game, chat, stats, and fallback.
    pub fn reset(&mut self) {
        let generation = self.generation + 1;
        *self = Self {
            generation,
            ..Self::default()
        };
    }

    pub fn games(&self) -> &[Game] {
        &self.games
    }

    pub fn current_game(&self) -> Option<&Game> {
        self.current_game.as_ref()
    }

    pub fn chat_messages(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn player_stats(&self) -> Option<&PlayerStats> {
        self.player_stats.as_ref()
    }

    pub fn joined(&self) -> Option<&JoinedGame> {
        self.joined.as_ref()
    }

    pub fn stats_user(&self) -> Option<&str> {
        self.stats_user.as_deref()
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
    use crate::error::SyncError;
    use crate::protocol::{events, Board, GameStatus, Mark};
    use serde_json::json;

    fn game(id: &str, board: [Option<Mark>; 9], updated_at: Option<i64>) -> Game {
        Game {
            id: id.into(),
            board: Board::new(board),
            players: vec!["ann".into(), "bob".into()],
            current_turn: Some("ann".into()),
            status: GameStatus::Playing,
            winner: None,
            updated_at,
        }
    }

    const EMPTY: [Option<Mark>; 9] = [None; 9];

    #[test]
    fn game_events_replace_state_in_order() {
        let mut bridge = SyncBridge::new();
        bridge.begin_join("1", "ann");
        bridge.apply(SyncUpdate::GameReplaced(game("1", EMPTY, Some(1))));

        let kind = ChannelKind::Game("1".into());
        let first = json!({
            "id": "1",
            "board": ["X", null, null, null, null, null, null, null, null],
            "players": ["ann", "bob"],
            "currentTurn": "bob",
            "status": "playing",
            "updatedAt": 2
        });
        let second = json!({
            "id": "1",
            "board": ["X", null, null, null, "O", null, null, null, null],
            "players": ["ann", "bob"],
            "currentTurn": "ann",
            "status": "playing",
            "updatedAt": 3
        });
        assert!(bridge.apply_event(&kind, events::PLAYER_MOVED, first).unwrap());
        assert!(bridge.apply_event(&kind, events::PLAYER_MOVED, second).unwrap());

        let current = bridge.current_game().unwrap();
        assert_eq!(current.board.get(0), Some(Mark::X));
        assert_eq!(current.board.get(4), Some(Mark::O));
        assert_eq!(current.current_turn.as_deref(), Some("ann"));
    }

    #[test]
    fn later_game_update_wins_exactly() {
        let mut bridge = SyncBridge::new();
        bridge.begin_join("1", "ann");
        let kind = ChannelKind::Game("1".into());

        let first = json!({
            "id": "1",
            "board": ["X", null, null, null, null, null, null, null, null]
        });
        let second = json!({
            "id": "1",
            "board": ["X", "O", null, null, null, null, null, null, null]
        });
        bridge.apply_event(&kind, events::GAME_UPDATED, first).unwrap();
        bridge.apply_event(&kind, events::GAME_UPDATED, second).unwrap();

        let mut expected = EMPTY;
        expected[0] = Some(Mark::X);
        expected[1] = Some(Mark::O);
        assert_eq!(bridge.current_game().unwrap().board, Board::new(expected));
    }

    #[test]
    fn switching_games_never_keeps_old_state() {
        let mut bridge = SyncBridge::new();
        let first = bridge.begin_join("1", "ann");
        let mut board = EMPTY;
        board[0] = Some(Mark::X);
        bridge.apply(SyncUpdate::GameReplaced(game("1", board, None)));
        bridge.apply(SyncUpdate::ChatAppended(ChatMessage {
            game_id: Some("1".into()),
            username: "bob".into(),
            message: "gl".into(),
            timestamp: None,
        }));

        let second = bridge.begin_join("2", "ann");
        assert!(bridge.current_game().is_none());
        assert!(bridge.chat_messages().is_empty());
        assert!(!bridge.is_current(first));
        assert!(bridge.is_current(second));

        // Late relay event for the old game.
        assert!(!bridge.apply(SyncUpdate::GameReplaced(game("1", board, None))));
        assert!(bridge.current_game().is_none());
    }

    #[test]
    fn stale_game_payload_is_dropped() {
        let mut bridge = SyncBridge::new();
        bridge.begin_join("1", "ann");
        let mut board = EMPTY;
        board[4] = Some(Mark::O);
        bridge.apply(SyncUpdate::GameReplaced(game("1", board, Some(20))));

        assert!(!bridge.apply(SyncUpdate::GameReplaced(game("1", EMPTY, Some(10)))));
        assert_eq!(bridge.current_game().unwrap().board.get(4), Some(Mark::O));
    }

    #[test]
    fn malformed_payload_leaves_state_alone() {
        let mut bridge = SyncBridge::new();
        bridge.begin_join("1", "ann");
        bridge.apply(SyncUpdate::GameReplaced(game("1", EMPTY, Some(1))));
        let before = bridge.current_game().cloned();

        let err = bridge
            .apply_event(
                &ChannelKind::Game("1".into()),
                events::GAME_UPDATED,
                json!({"id": "1", "board": ["X"]}),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::SyncApply(_)));
        assert_eq!(bridge.current_game().cloned(), before);
    }

    #[test]
    fn lobby_upserts_and_removals() {
        let mut bridge = SyncBridge::new();
        bridge.apply(SyncUpdate::LobbyReplaced(vec![game("1", EMPTY, Some(5))]));
        assert!(bridge.apply(SyncUpdate::LobbyUpserted(game("2", EMPTY, None))));
        assert!(!bridge.apply(SyncUpdate::LobbyUpserted(game("1", EMPTY, Some(4)))));
        assert!(bridge.apply(SyncUpdate::LobbyRemoved("1".into())));
        assert!(!bridge.apply(SyncUpdate::LobbyRemoved("1".into())));

        let ids: Vec<&str> = bridge.games().iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn chat_requires_joined_game() {
        let mut bridge = SyncBridge::new();
        let line = ChatMessage {
            game_id: None,
            username: "bob".into(),
            message: "hi".into(),
            timestamp: None,
        };
        assert!(!bridge.apply(SyncUpdate::ChatAppended(line.clone())));

        bridge.begin_join("3", "ann");
        assert!(bridge.apply(SyncUpdate::ChatAppended(line.clone())));
        assert!(bridge.apply(SyncUpdate::ChatAppended(line)));
        assert_eq!(bridge.chat_messages().len(), 2);

        assert!(!bridge.apply(SyncUpdate::ChatReplaced {
            game_id: "4".into(),
            messages: vec![],
        }));
        assert_eq!(bridge.chat_messages().len(), 2);
    }

    #[test]
    fn stats_only_for_tracked_user() {
        let mut bridge = SyncBridge::new();
        let stats = PlayerStats {
            username: "ann".into(),
            wins: 2,
            losses: 1,
            draws: 0,
        };
        assert!(!bridge.apply(SyncUpdate::StatsReplaced(stats.clone())));

        bridge.set_stats_user("ann");
        assert!(bridge.apply(SyncUpdate::StatsReplaced(stats.clone())));
        assert_eq!(bridge.player_stats(), Some(&stats));

        bridge.set_stats_user("bob");
        assert!(bridge.player_stats().is_none());
    }

    #[test]
    fn reset_invalidates_outstanding_generations() {
        let mut bridge = SyncBridge::new();
        let generation = bridge.begin_join("1", "ann");
        bridge.set_fallback(true);
        bridge.reset();
        assert!(!bridge.is_current(generation));
        assert!(!bridge.is_fallback());
        assert!(bridge.joined().is_none());
        assert!(bridge.begin_join("1", "ann") > generation);
    }
}
