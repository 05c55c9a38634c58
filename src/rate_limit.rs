//! Per-action sliding-window rate limiting.
//!
//! Each action key owns one [`RateWindow`]. The first call for a key opens a
//! window; calls inside it are counted until the limit is hit, after which
//! calls are rejected without touching the window. Once the window's reset
//! time has passed, the next call opens a fresh window with a count of one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Counter state for one action key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Accepted calls in the current window.
    pub count: u32,
    /// When the current window closes.
    pub window_reset_at: Instant,
}

/// A named limit: at most `limit` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub action: &'static str,
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub const fn new(action: &'static str, limit: u32, window: Duration) -> Self {
        Self {
            action,
            limit,
            window,
        }
    }
}

/// Limits applied by the sync client.
pub mod rules {
    use super::RateRule;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    pub const LOBBY_SUBSCRIBE: RateRule = RateRule::new("lobby_subscribe", 5, MINUTE);
    pub const USER_SUBSCRIBE: RateRule = RateRule::new("user_subscribe", 5, MINUTE);
    pub const GAME_JOIN: RateRule = RateRule::new("game_join", 5, MINUTE);
    pub const CHAT_SEND: RateRule = RateRule::new("chat_send", 10, Duration::from_secs(10));
    pub const POLL_GAMES: RateRule = RateRule::new("poll_games", 30, MINUTE);
    pub const POLL_GAME: RateRule = RateRule::new("poll_game", 30, MINUTE);
    pub const POLL_CHAT: RateRule = RateRule::new("poll_chat", 30, MINUTE);
    pub const POLL_STATS: RateRule = RateRule::new("poll_stats", 12, MINUTE);
}

/// Keyed sliding-window counters, scoped to one sync client instance.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt for `action_key` and report whether it is allowed.
    pub fn allow(&mut self, action_key: &str, limit: u32, window: Duration) -> bool {
        self.allow_at(action_key, limit, window, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&mut self, action_key: &str, limit: u32, window: Duration, now: Instant) -> bool {
        match self.windows.get_mut(action_key) {
            Some(current) if now < current.window_reset_at => {
                if current.count >= limit {
                    return false;
                }
                current.count += 1;
                true
            }
            _ => {
                if limit == 0 {
                    return false;
                }
                self.windows.insert(
                    action_key.to_string(),
                    RateWindow {
                        count: 1,
                        window_reset_at: now + window,
                    },
                );
                true
            }
        }
    }

    /// Apply a named [`RateRule`].
    pub fn allow_rule(&mut self, rule: RateRule) -> bool {
        self.allow(rule.action, rule.limit, rule.window)
    }

    /// Current window of `action_key`, if one was opened.
    pub fn window(&self, action_key: &str) -> Option<RateWindow> {
        self.windows.get(action_key).copied()
    }

    /// Drop every window.
    pub fn clear(&mut self) {
        self.windows.clear();
    }
}
