//! Typed error taxonomy for pairing, connection, and command failures.
//!
//! Every fault that can reach a terminal or the agent is one of these enums.
//! Each variant carries a stable wire `code` (matched on by clients) and a
//! single human-readable line — terminals never see a stack trace. Transport
//! and agent faults are converted to these at the point of detection; only
//! genuine programming faults are logged with a correlation id instead.

use std::fmt;

/// Failures of the pairing-code lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingError {
    /// Code does not exist (never issued, or already garbage-collected).
    InvalidCode,
    /// Code existed but its expiry window has passed without consumption.
    ExpiredCode,
    /// Code was already consumed by a previous pairing attempt.
    AlreadyUsed,
    /// Caller exceeded the per-user code issuance rate limit.
    RateLimited,
}

impl PairingError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCode => "INVALID_CODE",
            Self::ExpiredCode => "EXPIRED_CODE",
            Self::AlreadyUsed => "ALREADY_USED",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidCode => "pairing code not recognized",
            Self::ExpiredCode => "pairing code expired — request a new one",
            Self::AlreadyUsed => "pairing code already used — request a new one",
            Self::RateLimited => "too many pairing codes requested — wait a minute",
        }
    }
}

impl fmt::Display for PairingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for PairingError {}

/// Failures of the bridge connection itself.
///
/// These double as the failure reason attached to commands when a connection
/// dies with work outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionError {
    /// No `connected` bridge exists for the user.
    NoBridgeConnected,
    /// Bridge was evicted (heartbeat timeout) or the transport send failed.
    BridgeUnavailable,
    /// Bridge disconnected mid-flight (agent closed, explicit disconnect).
    BridgeDisconnected,
    /// Bridge was replaced by a newer successful pairing for the same user.
    BridgeReplaced,
}

impl ConnectionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoBridgeConnected => "NO_BRIDGE_CONNECTED",
            Self::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
            Self::BridgeDisconnected => "BRIDGE_DISCONNECTED",
            Self::BridgeReplaced => "BRIDGE_REPLACED",
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoBridgeConnected => {
                "bridge not connected — install and start the local bridge"
            }
            Self::BridgeUnavailable => "bridge unavailable — connection lost",
            Self::BridgeDisconnected => "bridge disconnected",
            Self::BridgeReplaced => "bridge replaced by a newer connection",
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ConnectionError {}

/// Failures of an individual routed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// The connection's pending queue is at its configured maximum.
    QueueFull,
    /// The agent did not report completion within the command timeout.
    Timeout,
    /// The agent ran the command and it exited non-zero.
    AgentExecutionFailure,
}

impl CommandError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "QUEUE_FULL",
            Self::Timeout => "COMMAND_TIMEOUT",
            Self::AgentExecutionFailure => "AGENT_EXECUTION_FAILURE",
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::QueueFull => "command queue full — wait for pending commands to finish",
            Self::Timeout => "command timed out waiting for the local agent",
            Self::AgentExecutionFailure => "command failed on the local agent",
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PairingError::AlreadyUsed.code(), "ALREADY_USED");
        assert_eq!(ConnectionError::NoBridgeConnected.code(), "NO_BRIDGE_CONNECTED");
        assert_eq!(CommandError::QueueFull.code(), "QUEUE_FULL");
    }

    #[test]
    fn test_messages_are_single_line() {
        let all: Vec<String> = vec![
            PairingError::InvalidCode.to_string(),
            ConnectionError::BridgeReplaced.to_string(),
            CommandError::Timeout.to_string(),
        ];
        for msg in all {
            assert!(!msg.contains('\n'));
        }
    }
}
