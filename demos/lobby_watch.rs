//! # Lobby Watch Example
//!
//! Connects to the relay, subscribes to the lobby and a player's channel,
//! and logs every change of the synchronized view until Ctrl+C:
//!
//! 1. Build the HTTP game API client (also the relay credentials source)
//! 2. Start the sync loop with the WebSocket relay connector
//! 3. Connect and subscribe
//! 4. Log connection state, fallback mode, lobby size and stats
//!
//! ## Running
//!
//! ```sh
//! # Point at a running game server, then:
//! TICTAC_API_URL=http://localhost:3000/api cargo run --example lobby_watch
//!
//! # Watch a specific player's stats:
//! TICTAC_USER=alice cargo run --example lobby_watch
//! ```

use std::sync::Arc;

use tictac_sync::{HttpGameApi, SyncClient, SyncConfig, WebSocketConnector};

/// Default API root when `TICTAC_API_URL` is not set.
const DEFAULT_API_URL: &str = "http://localhost:3000/api";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=tictac_sync=debug` for the sync loop's decisions.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let api_url = std::env::var("TICTAC_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let user = std::env::var("TICTAC_USER").ok();
    tracing::info!("Using game API at {api_url}");

    let api = Arc::new(HttpGameApi::new(&api_url)?);
    let (mut client, mut view) = SyncClient::start(
        WebSocketConnector::new(),
        api.clone(),
        api,
        SyncConfig::new(),
    );

    // ── Connect ─────────────────────────────────────────────────────
    client.connect()?;
    client.subscribe_to_lobby().await?;
    if let Some(user) = &user {
        client.subscribe_to_user(user.as_str()).await?;
    }

    // ── View loop ───────────────────────────────────────────────────
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    tracing::info!("Sync loop exited");
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                tracing::info!(
                    state = ?snapshot.connection_state,
                    fallback = snapshot.is_fallback_mode,
                    attempts = snapshot.reconnect_attempts,
                    games = snapshot.games.len(),
                    "view updated"
                );
                if let Some(error) = &snapshot.connection_error {
                    tracing::warn!("Connection error: {error}");
                }
                if let Some(stats) = &snapshot.player_stats {
                    tracing::info!(
                        "{}: {} wins / {} losses / {} draws",
                        stats.username, stats.wins, stats.losses, stats.draws
                    );
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    client.shutdown().await;
    Ok(())
}
