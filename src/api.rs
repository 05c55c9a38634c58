//! Game HTTP API and relay config endpoint seams.
//!
//! The sync layer never talks HTTP directly. It consumes these two traits so
//! that the concrete client ([`HttpGameApi`](crate::transports::HttpGameApi)
//! behind the `http-client` feature) can be swapped for a test double.
//!
//! Implementations must turn non-2xx responses into
//! [`SyncError::Http`](crate::SyncError::Http) instead of panicking.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ChatMessage, Game, PlayerStats, RelayCredentials};

/// CRUD-style game actions and reads.
#[async_trait]
pub trait GameApi: Send + Sync + 'static {
    /// `POST /game/create`
    async fn create_game(&self, username: &str) -> Result<Game>;

    /// `POST /game/join`
    async fn join_game(&self, game_id: &str, username: &str) -> Result<Game>;

    /// `POST /game/leave`
    async fn leave_game(&self, game_id: &str, username: &str) -> Result<()>;

    /// `POST /game/move`
    async fn make_move(&self, game_id: &str, username: &str, position: usize) -> Result<Game>;

    /// `POST /chat`
    async fn send_chat(&self, game_id: &str, username: &str, message: &str) -> Result<()>;

    /// `GET /game/list`
    async fn list_games(&self) -> Result<Vec<Game>>;

    /// `GET /games/:id`
    async fn get_game(&self, game_id: &str) -> Result<Game>;

    /// `GET /chat?gameId=`
    async fn get_chat(&self, game_id: &str) -> Result<Vec<ChatMessage>>;

    /// `GET /stats/:username`
    async fn get_stats(&self, username: &str) -> Result<PlayerStats>;
}

/// Source of relay credentials (`GET /config`).
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Fetch fresh credentials.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`](crate::SyncError::Config) if the endpoint
    /// is unreachable or the body is malformed.
    async fn fetch_config(&self) -> Result<RelayCredentials>;
}
