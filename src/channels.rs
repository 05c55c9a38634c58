//! Bookkeeping for relay channel subscriptions.
//!
//! [`ChannelRegistry`] is the only code path that calls the relay's
//! subscribe/bind/unsubscribe primitives. It keeps at most one
//! [`Subscription`] per channel name: subscribing again returns the existing
//! entry instead of binding a second set of handlers, which would otherwise
//! apply every future event twice.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::protocol::ChannelKind;
use crate::relay::{ChannelHandle, RelayClient};

/// One live channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel_name: String,
    pub kind: ChannelKind,
    pub handle: ChannelHandle,
    pub event_bindings: BTreeSet<&'static str>,
}

/// Tracks active subscriptions keyed by channel name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: HashMap<String, Subscription>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the channel for `kind`, or return the existing entry.
    ///
    /// Either the subscription and all of its bindings are committed, or the
    /// relay is rolled back and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if the relay rejects the subscribe or
    /// any bind.
    pub async fn subscribe(
        &mut self,
        relay: &mut dyn RelayClient,
        kind: &ChannelKind,
    ) -> Result<Subscription> {
        let name = kind.channel_name();
        if let Some(existing) = self.entries.get(&name) {
            debug!(channel = %name, "already subscribed, reusing entry");
            return Ok(existing.clone());
        }

        let handle = relay
            .subscribe(&name)
            .await
            .map_err(|e| channel_error(&name, e))?;

        let mut event_bindings = BTreeSet::new();
        for event in kind.events() {
            if let Err(e) = relay.bind(handle, event).await {
                warn!(channel = %name, event, "bind failed, rolling back subscription: {e}");
                if let Err(e) = relay.unbind_all(handle).await {
                    debug!(channel = %name, "rollback unbind failed: {e}");
                }
                if let Err(e) = relay.unsubscribe(handle).await {
                    debug!(channel = %name, "rollback unsubscribe failed: {e}");
                }
                return Err(channel_error(&name, e));
            }
            event_bindings.insert(*event);
        }

        let subscription = Subscription {
            channel_name: name.clone(),
            kind: kind.clone(),
            handle,
            event_bindings,
        };
        debug!(channel = %name, "subscribed");
        self.entries.insert(name, subscription.clone());
        Ok(subscription)
    }

    /// Unbind and release the channel named `channel_name`.
    ///
    /// Unknown names are a no-op. The entry is removed even if the relay
    /// reports an error while releasing it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if the relay fails to unbind or
    /// unsubscribe.
    pub async fn unsubscribe(
        &mut self,
        relay: &mut dyn RelayClient,
        channel_name: &str,
    ) -> Result<()> {
        let Some(subscription) = self.entries.remove(channel_name) else {
            debug!(channel = %channel_name, "not subscribed, nothing to release");
            return Ok(());
        };
        let unbound = relay.unbind_all(subscription.handle).await;
        let released = relay.unsubscribe(subscription.handle).await;
        debug!(channel = %channel_name, "unsubscribed");
        unbound
            .and(released)
            .map_err(|e| channel_error(channel_name, e))
    }

    /// Release every tracked channel. Relay errors are logged, not returned.
    pub async fn unsubscribe_all(&mut self, relay: &mut dyn RelayClient) {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unsubscribe(relay, &name).await {
                warn!(channel = %name, "unsubscribe during teardown failed: {e}");
            }
        }
    }

    /// Drop all entries without calling the relay.
    ///
    /// Used after the relay client itself has been released, when its
    /// handles no longer refer to anything.
    pub fn forget_all(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "forgetting subscriptions of released relay");
        }
        self.entries.clear();
    }

    /// The subscription that should receive `event` on `channel_name`, if bound.
    pub fn resolve(&self, channel_name: &str, event: &str) -> Option<&Subscription> {
        self.entries
            .get(channel_name)
            .filter(|sub| sub.event_bindings.contains(event))
    }

    pub fn get(&self, channel_name: &str) -> Option<&Subscription> {
        self.entries.get(channel_name)
    }

    pub fn contains(&self, channel_name: &str) -> bool {
        self.entries.contains_key(channel_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn channel_error(channel: &str, err: SyncError) -> SyncError {
    match err {
        already @ SyncError::Channel { .. } => already,
        other => SyncError::Channel {
            channel: channel.to_string(),
            message: other.to_string(),
        },
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
    use crate::protocol::{events, LOBBY_EVENTS};
    use crate::relay::RelayEvent;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Records relay calls; optionally fails one bind or every subscribe.
    #[derive(Default)]
    struct CountingRelay {
        next_handle: u64,
        subscribes: Vec<String>,
        binds: Vec<(ChannelHandle, String)>,
        unsubscribes: Vec<ChannelHandle>,
        live: HashSet<ChannelHandle>,
        fail_bind_on: Option<&'static str>,
        fail_subscribe: bool,
    }

    #[async_trait]
    impl RelayClient for CountingRelay {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&mut self, channel: &str) -> Result<ChannelHandle> {
            if self.fail_subscribe {
                return Err(SyncError::Connection("socket closed".into()));
            }
            self.next_handle += 1;
            let handle = ChannelHandle(self.next_handle);
            self.subscribes.push(channel.to_string());
            self.live.insert(handle);
            Ok(handle)
        }

        async fn bind(&mut self, handle: ChannelHandle, event: &str) -> Result<()> {
            if self.fail_bind_on == Some(event) {
                return Err(SyncError::Connection("bind rejected".into()));
            }
            self.binds.push((handle, event.to_string()));
            Ok(())
        }

        async fn unbind_all(&mut self, handle: ChannelHandle) -> Result<()> {
            self.binds.retain(|(h, _)| *h != handle);
            Ok(())
        }

        async fn unsubscribe(&mut self, handle: ChannelHandle) -> Result<()> {
            self.unsubscribes.push(handle);
            self.live.remove(&handle);
            Ok(())
        }

        async fn publish(
            &mut self,
            _channel: &str,
            _event: &str,
            _payload: serde_json::Value,
        ) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<RelayEvent> {
            None
        }
    }

    #[tokio::test]
    async fn subscribe_twice_binds_once() {
        let mut relay = CountingRelay::default();
        let mut registry = ChannelRegistry::new();

        let first = registry.subscribe(&mut relay, &ChannelKind::Lobby).await.unwrap();
        let second = registry.subscribe(&mut relay, &ChannelKind::Lobby).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(relay.subscribes, vec!["lobby".to_string()]);
        assert_eq!(relay.binds.len(), LOBBY_EVENTS.len());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn double_unsubscribe_is_a_no_op() {
        let mut relay = CountingRelay::default();
        let mut registry = ChannelRegistry::new();
        let kind = ChannelKind::Game("42".into());
        registry.subscribe(&mut relay, &kind).await.unwrap();

        registry.unsubscribe(&mut relay, "game-42").await.unwrap();
        registry.unsubscribe(&mut relay, "game-42").await.unwrap();

        assert_eq!(relay.unsubscribes.len(), 1);
        assert!(relay.binds.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_bind_rolls_back_the_subscription() {
        let mut relay = CountingRelay {
            fail_bind_on: Some(events::CHAT_MESSAGE),
            ..Default::default()
        };
        let mut registry = ChannelRegistry::new();

        let err = registry
            .subscribe(&mut relay, &ChannelKind::Game("9".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Channel { ref channel, .. } if channel == "game-9"));
        assert!(registry.is_empty());
        assert!(relay.live.is_empty());
        assert!(relay.binds.is_empty());
    }

    #[tokio::test]
    async fn failed_subscribe_records_nothing() {
        let mut relay = CountingRelay {
            fail_subscribe: true,
            ..Default::default()
        };
        let mut registry = ChannelRegistry::new();

        let err = registry
            .subscribe(&mut relay, &ChannelKind::User("ann".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Channel { .. }));
        assert!(!registry.contains("user-ann"));
    }

    #[tokio::test]
    async fn resolve_only_matches_bound_events() {
        let mut relay = CountingRelay::default();
        let mut registry = ChannelRegistry::new();
        registry
            .subscribe(&mut relay, &ChannelKind::User("ann".into()))
            .await
            .unwrap();

        assert!(registry.resolve("user-ann", events::STATS_UPDATED).is_some());
        assert!(registry.resolve("user-ann", events::CHAT_MESSAGE).is_none());
        assert!(registry.resolve("lobby", events::GAMES_UPDATED).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_all_releases_everything() {
        let mut relay = CountingRelay::default();
        let mut registry = ChannelRegistry::new();
        registry.subscribe(&mut relay, &ChannelKind::Lobby).await.unwrap();
        registry
            .subscribe(&mut relay, &ChannelKind::Game("1".into()))
            .await
            .unwrap();

        registry.unsubscribe_all(&mut relay).await;

        assert!(registry.is_empty());
        assert!(relay.live.is_empty());
    }
}
