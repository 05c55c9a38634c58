//! [`GameApi`] and [`ConfigSource`] over HTTP using `reqwest`.
//!
//! Paths are resolved against a base URL, so the API can live under a
//! prefix such as `https://example.com/api/`. Request bodies use the
//! server's camelCase field names.
//!
//! # Feature gate
//!
//! Only available with the `http-client` feature (on by default).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::api::{ConfigSource, GameApi};
use crate::error::{Result, SyncError};
use crate::protocol::{ChatMessage, Game, PlayerStats, RelayCredentials};

/// Game API client rooted at a base URL.
#[derive(Debug, Clone)]
pub struct HttpGameApi {
    base: Url,
    http: reqwest::Client,
}

impl HttpGameApi {
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Use a preconfigured `reqwest` client (timeouts, proxies, headers).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `base_url` is not a valid absolute URL.
    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self> {
        // Without the trailing slash `join` would replace the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| SyncError::Config(format!("invalid api url `{base_url}`: {e}")))?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `base` + fixed path segments, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| SyncError::Config(format!("api url `{}` cannot have a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "GET");
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        read_json(response).await
    }

    async fn post<T: DeserializeOwned>(&self, segments: &[&str], body: &Value) -> Result<T> {
        let url = self.endpoint(segments)?;
        debug!(%url, "POST");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn post_unit(&self, segments: &[&str], body: &Value) -> Result<()> {
        let url = self.endpoint(segments)?;
        debug!(%url, "POST");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl GameApi for HttpGameApi {
    async fn create_game(&self, username: &str) -> Result<Game> {
        self.post(&["game", "create"], &json!({ "username": username }))
            .await
    }

    async fn join_game(&self, game_id: &str, username: &str) -> Result<Game> {
        self.post(
            &["game", "join"],
            &json!({ "gameId": game_id, "username": username }),
        )
        .await
    }

    async fn leave_game(&self, game_id: &str, username: &str) -> Result<()> {
        self.post_unit(
            &["game", "leave"],
            &json!({ "gameId": game_id, "username": username }),
        )
        .await
    }

    async fn make_move(&self, game_id: &str, username: &str, position: usize) -> Result<Game> {
        self.post(
            &["game", "move"],
            &json!({ "gameId": game_id, "username": username, "position": position }),
        )
        .await
    }

    async fn send_chat(&self, game_id: &str, username: &str, message: &str) -> Result<()> {
        self.post_unit(
            &["chat"],
            &json!({ "gameId": game_id, "username": username, "message": message }),
        )
        .await
    }

    async fn list_games(&self) -> Result<Vec<Game>> {
        self.get(self.endpoint(&["game", "list"])?).await
    }

    async fn get_game(&self, game_id: &str) -> Result<Game> {
        self.get(self.endpoint(&["games", game_id])?).await
    }

    async fn get_chat(&self, game_id: &str) -> Result<Vec<ChatMessage>> {
        let mut url = self.endpoint(&["chat"])?;
        url.query_pairs_mut().append_pair("gameId", game_id);
        self.get(url).await
    }

    async fn get_stats(&self, username: &str) -> Result<PlayerStats> {
        self.get(self.endpoint(&["stats", username])?).await
    }
}

#[async_trait]
impl ConfigSource for HttpGameApi {
    async fn fetch_config(&self) -> Result<RelayCredentials> {
        let url = self.endpoint(&["config"])?;
        self.get(url).await.map_err(|e| match e {
            already @ SyncError::Config(_) => already,
            other => SyncError::Config(other.to_string()),
        })
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    SyncError::Http {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

/// Turn a non-2xx response into [`SyncError::Http`] carrying the body text.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Http {
        status: Some(status.as_u16()),
        message: if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        },
    })
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = check_status(response).await?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| SyncError::Http {
        status: Some(status),
        message: format!("malformed response body: {e}"),
    })
}
