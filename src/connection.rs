//! Connection lifecycle state machine.
//!
//! [`ConnectionStateMachine`] decides every transition of the relay
//! connection and reports what has to happen as a list of [`Effect`]s. It
//! performs no I/O and owns no timers: the sync loop executes the effects,
//! which keeps every transition testable without a runtime.
//!
//! ```text
//! idle ──connect──▶ connecting ──relay connected──▶ connected
//!                      │  ▲                           │
//!          error/timeout│  │retry (backoff)            │transport drop
//!                      ▼  │                           ▼
//!                    failed ◀──────────────────── disconnected
//!                      ▲                              │grace elapsed /
//!                      └──── max attempts ◀── suspended ◀┘ relay suspended
//! ```
//!
//! Exactly one attempt may be in flight. That is tracked with a latch rather
//! than the state alone, because both `suspended` and `failed` lead to a
//! fresh attempt. A second latch marks a user-initiated attempt from the
//! moment it is requested until it connects or ends in any other way;
//! fallback polling pauses while it is set.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SyncError;

/// Connection state as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Failed,
}

/// Reconnect bookkeeping fed into [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectAttempt {
    pub count: u32,
    pub last_attempt_at: Option<Instant>,
}

/// Side effects the owner must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ArmConnectTimeout,
    ClearConnectTimeout,
    StartHeartbeat,
    StopHeartbeat,
    ArmGracePeriod,
    ClearGracePeriod,
    ScheduleRetry(Duration),
    CancelRetry,
    ArmManualReconnect,
    EnterFallback,
    ExitFallback,
    /// Drop the relay client handle entirely.
    ReleaseRelay,
    /// Subscribe every channel the UI currently wants.
    Resubscribe,
}

/// Owns [`ConnectionState`], the in-flight latch, and [`ReconnectAttempt`].
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempt: ReconnectAttempt,
    in_flight: bool,
    manual_pending: bool,
    terminal: bool,
    last_error: Option<String>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl ConnectionStateMachine {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: ReconnectAttempt::default(),
            in_flight: false,
            manual_pending: false,
            terminal: false,
            last_error: None,
            policy,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> ReconnectAttempt {
        self.attempt
    }

    pub fn is_attempt_in_flight(&self) -> bool {
        self.in_flight
    }

    /// `true` from a manual reconnect request until that attempt resolves.
    pub fn is_manual_pending(&self) -> bool {
        self.manual_pending
    }

    /// `true` once automatic retries are exhausted.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Start an attempt. Returns `None` (a logged no-op) while an attempt is
    /// in flight or the connection is already up.
    pub fn begin_connect(&mut self, now: Instant) -> Option<Vec<Effect>> {
        if self.in_flight || self.state == ConnectionState::Connected {
            debug!(state = ?self.state, "connect ignored: attempt in flight or already connected");
            return None;
        }
        self.in_flight = true;
        self.state = ConnectionState::Connecting;
        self.attempt.last_attempt_at = Some(now);
        Some(vec![
            Effect::CancelRetry,
            Effect::ClearGracePeriod,
            Effect::ArmConnectTimeout,
        ])
    }

    /// The relay reports the connection is up.
    pub fn on_connected(&mut self) -> Vec<Effect> {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Connected) {
            debug!(state = ?self.state, "ignoring connected report");
            return Vec::new();
        }
        info!(after_attempts = self.attempt.count, "relay connected");
        self.state = ConnectionState::Connected;
        self.in_flight = false;
        self.manual_pending = false;
        self.terminal = false;
        self.attempt.count = 0;
        self.last_error = None;
        vec![
            Effect::ClearConnectTimeout,
            Effect::ClearGracePeriod,
            Effect::CancelRetry,
            Effect::StartHeartbeat,
            Effect::ExitFallback,
            Effect::Resubscribe,
        ]
    }

    /// The attempt (or an established connection) failed.
    pub fn on_failed(&mut self, error: &SyncError) -> Vec<Effect> {
        if self.state == ConnectionState::Idle {
            debug!("ignoring failure reported after disconnect: {error}");
            return Vec::new();
        }
        self.state = ConnectionState::Failed;
        self.in_flight = false;
        self.manual_pending = false;
        self.last_error = Some(error.to_string());

        let mut effects = vec![
            Effect::ClearConnectTimeout,
            Effect::StopHeartbeat,
            Effect::ClearGracePeriod,
            Effect::ReleaseRelay,
        ];
        effects.push(self.retry_or_give_up());
        effects
    }

    /// The transport dropped. Waits for the relay or the grace period
    /// instead of retrying at once.
    pub fn on_disconnected(&mut self, reason: Option<&str>) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connected => {
                warn!(reason = reason.unwrap_or("none"), "relay transport dropped");
                self.state = ConnectionState::Disconnected;
                vec![Effect::StopHeartbeat, Effect::ArmGracePeriod]
            }
            ConnectionState::Connecting => {
                let reason = reason.unwrap_or("transport closed while connecting");
                self.on_failed(&SyncError::Connection(reason.to_string()))
            }
            _ => Vec::new(),
        }
    }

    /// The relay cannot recover on its own. Fallback starts immediately.
    pub fn on_suspended(&mut self, reason: Option<&str>) -> Vec<Effect> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Suspended | ConnectionState::Failed
        ) {
            return Vec::new();
        }
        warn!(reason = reason.unwrap_or("none"), "relay suspended");
        self.state = ConnectionState::Suspended;
        self.in_flight = false;
        self.manual_pending = false;
        if let Some(reason) = reason {
            self.last_error = Some(reason.to_string());
        }

        let mut effects = vec![
            Effect::StopHeartbeat,
            Effect::ClearGracePeriod,
            Effect::ClearConnectTimeout,
            Effect::EnterFallback,
        ];
        effects.push(self.retry_or_give_up());
        effects
    }

    /// The disconnect grace period ran out.
    pub fn grace_elapsed(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.on_suspended(Some("connection did not recover within grace period"))
    }

    /// The connection-attempt timeout ran out.
    pub fn timeout_elapsed(&mut self, timeout: Duration) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.on_failed(&SyncError::ConnectionTimeout(timeout))
    }

    /// User-initiated retry: clears the attempt count and bypasses the cap.
    ///
    /// The state reads `connecting` through the debounce delay; the attempt
    /// itself starts when the owner's manual reconnect timer fires.
    pub fn manual_reconnect(&mut self) -> Vec<Effect> {
        info!("manual reconnect requested");
        self.state = ConnectionState::Connecting;
        self.in_flight = false;
        self.manual_pending = true;
        self.terminal = false;
        self.attempt.count = 0;
        self.last_error = None;
        vec![
            Effect::ClearConnectTimeout,
            Effect::StopHeartbeat,
            Effect::ClearGracePeriod,
            Effect::CancelRetry,
            Effect::ReleaseRelay,
            Effect::ArmManualReconnect,
        ]
    }

    /// Explicit disconnect: back to `idle` with everything cleared.
    pub fn reset(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Idle;
        self.in_flight = false;
        self.manual_pending = false;
        self.terminal = false;
        self.attempt = ReconnectAttempt::default();
        self.last_error = None;
        vec![
            Effect::ClearConnectTimeout,
            Effect::StopHeartbeat,
            Effect::ClearGracePeriod,
            Effect::CancelRetry,
            Effect::ExitFallback,
            Effect::ReleaseRelay,
        ]
    }

    /// Bump the attempt count and either schedule a retry or go terminal.
    ///
    /// The delay uses the count before the bump, so the first failure after
    /// a successful connection always waits `base`.
    fn retry_or_give_up(&mut self) -> Effect {
        let delay = self.policy.next_delay(self.attempt.count);
        self.attempt.count = self.attempt.count.saturating_add(1);
        if self.attempt.count < self.max_attempts {
            info!(
                attempt = self.attempt.count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling reconnect"
            );
            Effect::ScheduleRetry(delay)
        } else {
            warn!(
                attempts = self.attempt.count,
                "reconnect attempts exhausted, manual reconnect required"
            );
            self.state = ConnectionState::Failed;
            self.terminal = true;
            Effect::EnterFallback
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            max_attempts,
        )
    }

    fn fail(m: &mut ConnectionStateMachine) -> Vec<Effect> {
        m.on_failed(&SyncError::Connection("refused".into()))
    }

    #[test]
    fn second_connect_while_connecting_is_ignored() {
        let mut m = machine(5);
        assert!(m.begin_connect(Instant::now()).is_some());
        assert!(m.begin_connect(Instant::now()).is_none());
        m.on_connected();
        assert!(m.begin_connect(Instant::now()).is_none());
    }

    #[test]
    fn connected_clears_timeout_and_starts_heartbeat() {
        let mut m = machine(5);
        m.begin_connect(Instant::now());
        let effects = m.on_connected();
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(effects.contains(&Effect::ClearConnectTimeout));
        assert!(effects.contains(&Effect::StartHeartbeat));
        assert!(effects.contains(&Effect::Resubscribe));
        assert!(!m.is_attempt_in_flight());
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let mut m = machine(3);
        let mut retries = Vec::new();
        for _ in 0..3 {
            m.begin_connect(Instant::now()).unwrap();
            let effects = fail(&mut m);
            retries.extend(effects.into_iter().filter_map(|e| match e {
                Effect::ScheduleRetry(d) => Some(d),
                _ => None,
            }));
        }

        assert_eq!(
            retries,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(m.is_terminal());
        assert_eq!(m.attempt().count, 3);

        let effects = m.manual_reconnect();
        assert!(effects.contains(&Effect::ArmManualReconnect));
        assert_eq!(m.attempt().count, 0);
        assert!(!m.is_terminal());
        assert!(m.begin_connect(Instant::now()).is_some());
    }

    #[test]
    fn terminal_failure_enters_fallback() {
        let mut m = machine(1);
        m.begin_connect(Instant::now());
        let effects = fail(&mut m);
        assert!(effects.contains(&Effect::EnterFallback));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleRetry(_))));
    }

    #[test]
    fn connected_resets_attempt_count() {
        let mut m = machine(10);
        for _ in 0..4 {
            m.begin_connect(Instant::now());
            fail(&mut m);
        }
        assert_eq!(m.attempt().count, 4);

        m.begin_connect(Instant::now());
        m.on_connected();
        assert_eq!(m.attempt().count, 0);

        let effects = fail(&mut m);
        assert!(effects.contains(&Effect::ScheduleRetry(Duration::from_millis(100))));
    }

    #[test]
    fn timeout_only_applies_while_connecting() {
        let mut m = machine(5);
        assert!(m.timeout_elapsed(Duration::from_secs(10)).is_empty());

        m.begin_connect(Instant::now());
        let effects = m.timeout_elapsed(Duration::from_secs(10));
        assert!(effects.contains(&Effect::ReleaseRelay));
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(m.last_error().unwrap().contains("timed out"));
        assert!(m.timeout_elapsed(Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn drop_waits_for_grace_then_suspends() {
        let mut m = machine(5);
        m.begin_connect(Instant::now());
        m.on_connected();

        let effects = m.on_disconnected(Some("reset by peer"));
        assert_eq!(effects, vec![Effect::StopHeartbeat, Effect::ArmGracePeriod]);
        assert_eq!(m.state(), ConnectionState::Disconnected);

        let effects = m.grace_elapsed();
        assert_eq!(m.state(), ConnectionState::Suspended);
        assert!(effects.contains(&Effect::EnterFallback));
        assert!(effects.contains(&Effect::ScheduleRetry(Duration::from_millis(100))));
        assert_eq!(m.attempt().count, 1);
    }

    #[test]
    fn self_healed_drop_never_suspends() {
        let mut m = machine(5);
        m.begin_connect(Instant::now());
        m.on_connected();
        m.on_disconnected(None);
        let effects = m.on_connected();
        assert!(effects.contains(&Effect::ClearGracePeriod));
        assert!(m.grace_elapsed().is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn drop_while_connecting_is_a_failure() {
        let mut m = machine(5);
        m.begin_connect(Instant::now());
        let effects = m.on_disconnected(None);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(effects.contains(&Effect::ReleaseRelay));
    }

    #[test]
    fn reset_returns_to_idle_and_ignores_late_reports() {
        let mut m = machine(5);
        m.begin_connect(Instant::now());
        let effects = m.reset();
        assert!(effects.contains(&Effect::ReleaseRelay));
        assert_eq!(m.state(), ConnectionState::Idle);
        assert!(m.on_connected().is_empty());
        assert!(fail(&mut m).is_empty());
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn manual_reconnect_reads_as_connecting_until_resolved() {
        let mut m = machine(1);
        m.begin_connect(Instant::now());
        fail(&mut m);
        assert!(m.is_terminal());

        m.manual_reconnect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.is_manual_pending());
        assert!(m.last_error().is_none());
        assert!(m.begin_connect(Instant::now()).is_some());
        assert!(m.is_manual_pending());

        m.on_connected();
        assert!(!m.is_manual_pending());
    }

    #[test]
    fn manual_latch_clears_however_the_attempt_ends() {
        let outcomes: [fn(&mut ConnectionStateMachine); 4] = [
            |m| {
                m.on_suspended(Some("over capacity"));
            },
            |m| {
                m.on_disconnected(None);
            },
            |m| {
                m.timeout_elapsed(Duration::from_secs(10));
            },
            |m| {
                fail(m);
            },
        ];
        for end in outcomes {
            let mut m = machine(1);
            m.manual_reconnect();
            m.begin_connect(Instant::now()).unwrap();
            end(&mut m);
            assert!(!m.is_manual_pending(), "latch left set in {:?}", m.state());
            assert!(m.is_terminal());
        }
    }

    #[test]
    fn reset_clears_a_pending_manual_reconnect() {
        let mut m = machine(5);
        m.manual_reconnect();
        m.reset();
        assert!(!m.is_manual_pending());
        assert_eq!(m.state(), ConnectionState::Idle);
    }
}
