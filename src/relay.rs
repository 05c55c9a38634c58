//! Relay abstraction for the hosted publish/subscribe service.
//!
//! The [`RelayClient`] trait is the narrow surface the sync layer needs from a
//! realtime relay: open and close a connection, subscribe to named channels,
//! bind event names on them, publish, and report what happened through a
//! single stream of [`RelayEvent`]s.
//!
//! # Lifecycle
//!
//! A [`RelayConnector`] builds a fresh client for every connection attempt.
//! The sync loop drops the whole client on teardown rather than reusing it,
//! so a later attempt never inherits sockets, bindings or queued events from
//! a previous one.
//!
//! # Implementing a Custom Relay
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tictac_sync::error::SyncError;
//! use tictac_sync::relay::{ChannelHandle, RelayClient, RelayEvent};
//!
//! struct MyRelay { /* ... */ }
//!
//! #[async_trait]
//! impl RelayClient for MyRelay {
//!     async fn connect(&mut self) -> Result<(), SyncError> { todo!() }
//!     async fn disconnect(&mut self) -> Result<(), SyncError> { todo!() }
//!     async fn subscribe(&mut self, channel: &str) -> Result<ChannelHandle, SyncError> { todo!() }
//!     async fn bind(&mut self, handle: ChannelHandle, event: &str) -> Result<(), SyncError> { todo!() }
//!     async fn unbind_all(&mut self, handle: ChannelHandle) -> Result<(), SyncError> { todo!() }
//!     async fn unsubscribe(&mut self, handle: ChannelHandle) -> Result<(), SyncError> { todo!() }
//!     async fn publish(
//!         &mut self,
//!         channel: &str,
//!         event: &str,
//!         payload: serde_json::Value,
//!     ) -> Result<(), SyncError> { todo!() }
//!     async fn next_event(&mut self) -> Option<RelayEvent> { todo!() }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SyncError;
use crate::protocol::RelayCredentials;

/// Opaque reference to a subscribed relay channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Connection states as reported by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    /// The relay is opening a connection.
    Connecting,
    /// The connection is established and usable.
    Connected,
    /// The transport dropped; the relay may recover on its own.
    Disconnected { reason: Option<String> },
    /// The relay gave up recovering on its own for now.
    Suspended { reason: Option<String> },
    /// The attempt failed.
    Failed { reason: String },
}

/// Everything a relay client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The relay changed connection state.
    State(RelayState),
    /// A bound event arrived on a subscribed channel.
    Message {
        channel: String,
        event: String,
        data: serde_json::Value,
    },
    /// The relay refused a subscription after [`RelayClient::subscribe`]
    /// returned. The channel delivers nothing until subscribed again.
    SubscriptionFailed { channel: String, reason: String },
}

/// A realtime relay client.
///
/// # Object Safety
///
/// The sync loop holds clients as `Box<dyn RelayClient>`.
///
/// # Cancel Safety
///
/// [`next_event`](RelayClient::next_event) **MUST** be cancel-safe because it
/// is polled inside `tokio::select!`. Channel-backed implementations
/// (wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait RelayClient: Send + 'static {
    /// Begin connecting. Completion is reported as a
    /// [`RelayState::Connected`] or [`RelayState::Failed`] event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Connection`] if the attempt cannot even be started.
    async fn connect(&mut self) -> Result<(), SyncError>;

    /// Close the connection and release every resource held by the client.
    async fn disconnect(&mut self) -> Result<(), SyncError>;

    /// Subscribe to `channel` and return a handle for it.
    async fn subscribe(&mut self, channel: &str) -> Result<ChannelHandle, SyncError>;

    /// Start delivering `event` from the channel behind `handle`.
    async fn bind(&mut self, handle: ChannelHandle, event: &str) -> Result<(), SyncError>;

    /// Stop delivering every event bound on `handle`.
    async fn unbind_all(&mut self, handle: ChannelHandle) -> Result<(), SyncError>;

    /// Unsubscribe the channel behind `handle`.
    async fn unsubscribe(&mut self, handle: ChannelHandle) -> Result<(), SyncError>;

    /// Publish `payload` as `event` on `channel`.
    async fn publish(
        &mut self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SyncError>;

    /// Receive the next state change or bound message.
    ///
    /// Returns `None` once the client can produce no further events.
    async fn next_event(&mut self) -> Option<RelayEvent>;
}

/// Builds a new [`RelayClient`] for each connection attempt.
pub trait RelayConnector: Send + Sync + 'static {
    /// Create an unconnected client for `credentials`.
    fn create(&self, credentials: &RelayCredentials) -> Box<dyn RelayClient>;
}

impl<F> RelayConnector for F
where
    F: Fn(&RelayCredentials) -> Box<dyn RelayClient> + Send + Sync + 'static,
{
    fn create(&self, credentials: &RelayCredentials) -> Box<dyn RelayClient> {
        self(credentials)
    }
}
