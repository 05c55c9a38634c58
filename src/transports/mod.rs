//! Concrete relay and game API implementations.
//!
//! Each lives behind a Cargo feature, both enabled by default:
//!
//! | Feature               | Provides                                       |
//! |-----------------------|------------------------------------------------|
//! | `transport-websocket` | [`WebSocketConnector`], [`WebSocketRelay`]     |
//! | `http-client`         | [`HttpGameApi`] (`GameApi` + `ConfigSource`)   |
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tictac_sync::SyncError> {
//! use std::sync::Arc;
//! use tictac_sync::{HttpGameApi, SyncClient, SyncConfig, WebSocketConnector};
//!
//! let api = Arc::new(HttpGameApi::new("https://example.com/api/")?);
//! let (client, _view) = SyncClient::start(
//!     WebSocketConnector::new(),
//!     api.clone(),
//!     api,
//!     SyncConfig::new(),
//! );
//! client.connect()?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "http-client")]
pub mod http;
#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "http-client")]
pub use http::HttpGameApi;
#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketRelay};
