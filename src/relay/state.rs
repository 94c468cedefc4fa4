//! Connection and session lifecycle states.

use std::fmt;

/// Lifecycle of one side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// We sent a close frame and are waiting for the peer to go away
    Closing,
    Closed,
}

impl ConnectionState {
    /// Messages may only be written to a peer in this state.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the session as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Both sides exist and messages are pumped
    Active,
    /// One side closed or failed; the other is being closed
    HalfClosing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Active => "active",
            SessionPhase::HalfClosing => "half_closing",
            SessionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side ended the session, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The browser closed; `code` is absent when it sent no status
    ClientClosed { code: Option<u16> },
    /// The upstream closed; `code` is absent when it sent no status
    UpstreamClosed { code: Option<u16> },
    /// A RelayError ended the session; holds `RelayError::kind()`
    Failed(&'static str),
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionOutcome::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_open_accepts_messages() {
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(!ConnectionState::Closing.is_open());
        assert!(!ConnectionState::Closed.is_open());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(SessionPhase::HalfClosing.to_string(), "half_closing");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
