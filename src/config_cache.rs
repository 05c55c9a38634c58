//! TTL cache for relay credentials.
//!
//! Credentials are fetched from the config endpoint at most once per TTL so
//! that a reconnect storm does not turn into a config-endpoint storm, while
//! rotated credentials are still picked up once the entry expires. Failed
//! fetches are never cached.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::api::ConfigSource;
use crate::error::Result;
use crate::protocol::RelayCredentials;

/// Default lifetime of a cached credentials entry.
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CachedConfig {
    value: RelayCredentials,
    fetched_at: Instant,
}

/// Memoizes [`RelayCredentials`] for a fixed TTL.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    ttl: Duration,
    entry: Option<CachedConfig>,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Return cached credentials, fetching from `source` on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the source's error; nothing is cached in that case.
    pub async fn get_config(&mut self, source: &dyn ConfigSource) -> Result<RelayCredentials> {
        if let Some(hit) = self.cached_at(Instant::now()) {
            return Ok(hit);
        }
        let value = source.fetch_config().await?;
        self.store_at(value.clone(), Instant::now());
        Ok(value)
    }

    /// The cached value if it is still fresh at `now`.
    pub fn cached_at(&self, now: Instant) -> Option<RelayCredentials> {
        let entry = self.entry.as_ref()?;
        if now.saturating_duration_since(entry.fetched_at) < self.ttl {
            Some(entry.value.clone())
        } else {
            debug!("relay config cache entry expired");
            None
        }
    }

    /// [`cached_at`](Self::cached_at) using the current time.
    pub fn cached(&self) -> Option<RelayCredentials> {
        self.cached_at(Instant::now())
    }

    /// Store a successfully fetched value.
    pub fn store_at(&mut self, value: RelayCredentials, fetched_at: Instant) {
        self.entry = Some(CachedConfig { value, fetched_at });
    }

    /// [`store_at`](Self::store_at) using the current time.
    pub fn store(&mut self, value: RelayCredentials) {
        self.store_at(value, Instant::now());
    }

    /// Forget the cached entry.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_TTL)
    }
}
