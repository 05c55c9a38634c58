//! Relay error codes and how the connection layer should react to them.
//!
//! The WebSocket relay speaks the Pusher Channels protocol, which reports
//! failures either as a `pusher:error` event or as a WebSocket close code.
//! Both share one numbering scheme, grouped into ranges that tell the client
//! whether reconnecting can help.

use std::fmt;

/// How the connection layer should treat a relay error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retrying with the same credentials cannot succeed (4000-4099).
    Fatal,
    /// The relay asked the client to back off before reconnecting (4100-4199).
    ReconnectLater,
    /// The connection dropped for a transient reason (4200-4299 and unknown codes).
    ReconnectNow,
}

/// Structured error codes reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorCode {
    // Fatal: configuration or credential problems
    ApplicationNotFound,
    ApplicationDisabled,
    OverConnectionQuota,
    PathNotFound,
    InvalidVersion,
    UnsupportedProtocol,
    NoProtocolVersion,
    Unauthorized,

    // Back off
    OverCapacity,

    // Transient
    GenericReconnect,
    PongNotReceived,
    ClosedForInactivity,

    // Client events
    ClientEventRejected,

    /// Any code without a dedicated variant.
    Other(u16),
}

impl RelayErrorCode {
    /// Map a numeric code to its variant.
    pub fn from_code(code: u16) -> Self {
        match code {
            4001 => Self::ApplicationNotFound,
            4003 => Self::ApplicationDisabled,
            4004 => Self::OverConnectionQuota,
            4005 => Self::PathNotFound,
            4006 => Self::InvalidVersion,
            4007 => Self::UnsupportedProtocol,
            4008 => Self::NoProtocolVersion,
            4009 => Self::Unauthorized,
            4100 => Self::OverCapacity,
            4200 => Self::GenericReconnect,
            4201 => Self::PongNotReceived,
            4202 => Self::ClosedForInactivity,
            4301 => Self::ClientEventRejected,
            other => Self::Other(other),
        }
    }

    /// Numeric code as sent on the wire.
    pub fn code(&self) -> u16 {
        match self {
            Self::ApplicationNotFound => 4001,
            Self::ApplicationDisabled => 4003,
            Self::OverConnectionQuota => 4004,
            Self::PathNotFound => 4005,
            Self::InvalidVersion => 4006,
            Self::UnsupportedProtocol => 4007,
            Self::NoProtocolVersion => 4008,
            Self::Unauthorized => 4009,
            Self::OverCapacity => 4100,
            Self::GenericReconnect => 4200,
            Self::PongNotReceived => 4201,
            Self::ClosedForInactivity => 4202,
            Self::ClientEventRejected => 4301,
            Self::Other(code) => *code,
        }
    }

    /// Whether reconnecting can help, derived from the code range.
    pub fn retry_class(&self) -> RetryClass {
        match self.code() {
            4000..=4099 => RetryClass::Fatal,
            4100..=4199 => RetryClass::ReconnectLater,
            _ => RetryClass::ReconnectNow,
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ApplicationNotFound => "The relay application key is not recognized.",
            Self::ApplicationDisabled => "The relay application has been disabled.",
            Self::OverConnectionQuota => {
                "The relay application is over its connection quota. Try again later."
            }
            Self::PathNotFound => "The relay endpoint path does not exist.",
            Self::InvalidVersion => "The relay rejected the requested protocol version.",
            Self::UnsupportedProtocol => "The relay does not support this protocol version.",
            Self::NoProtocolVersion => "No protocol version was supplied to the relay.",
            Self::Unauthorized => "The relay rejected the connection credentials.",
            Self::OverCapacity => "The relay is over capacity. Back off before reconnecting.",
            Self::GenericReconnect => "The relay closed the connection. Reconnect immediately.",
            Self::PongNotReceived => "The relay did not receive a pong in time.",
            Self::ClosedForInactivity => "The relay closed the connection after inactivity.",
            Self::ClientEventRejected => "The relay rejected a client event.",
            Self::Other(_) => "Unrecognized relay error code.",
        }
    }
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}
