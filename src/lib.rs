//! # tictac-sync
//!
//! Connection lifecycle and state synchronization for a turn-based
//! two-player game client whose live updates arrive through a hosted
//! publish/subscribe relay.
//!
//! ## Features
//!
//! - **One owner per concern**: a single background loop owns the relay
//!   handle, subscriptions, timers and local game state; the UI drives it
//!   through [`SyncClient`] and observes it through a [`SyncView`] watch
//!   channel
//! - **Bounded reconnects**: exponential [`BackoffPolicy`], a fixed attempt
//!   cap, and a manual reconnect that bypasses it
//! - **Polling fallback**: while the relay is suspended or has given up, the
//!   game HTTP API is polled through the same [`SyncBridge`] that applies
//!   relay events
//! - **Client-side rate limits** on subscriptions, joins, chat and polls
//! - **Pluggable seams**: [`RelayClient`], [`GameApi`] and [`ConfigSource`]
//!   are traits; `transport-websocket` and `http-client` provide the default
//!   implementations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tictac_sync::SyncError> {
//! use std::sync::Arc;
//! use tictac_sync::{HttpGameApi, SyncClient, SyncConfig, WebSocketConnector};
//!
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
//! client.subscribe_to_user("alice").await?;
//!
//! while view.changed().await.is_ok() {
//!     let snapshot = view.borrow().clone();
//!     println!("{:?}: {} games", snapshot.connection_state, snapshot.games.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod backoff;
pub mod channels;
pub mod client;
pub mod config_cache;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod sync;
pub mod timer;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use api::{ConfigSource, GameApi};
pub use backoff::BackoffPolicy;
pub use channels::{ChannelRegistry, Subscription};
pub use client::{SyncClient, SyncConfig, SyncView};
pub use config_cache::ConfigCache;
pub use connection::{ConnectionState, ConnectionStateMachine, ReconnectAttempt};
pub use error::SyncError;
pub use error_codes::{RelayErrorCode, RetryClass};
pub use protocol::{ChannelKind, ChatMessage, Game, PlayerStats, RelayCredentials, SyncUpdate};
pub use rate_limit::{RateLimiter, RateWindow};
pub use relay::{ChannelHandle, RelayClient, RelayConnector, RelayEvent, RelayState};
pub use sync::SyncBridge;

#[cfg(feature = "http-client")]
pub use transports::HttpGameApi;
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketRelay};
