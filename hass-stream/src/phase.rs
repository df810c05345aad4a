//! Connection lifecycle phases

use std::fmt;

/// Where a connection is in its lifecycle
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Ready -> Closed
///                      \______________________________/
///                         auth_ok may skip Authenticating
/// ```
///
/// `Closed` is reachable from every phase and is terminal: a closed
/// connection is never reopened, a new one is created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

impl ConnectionPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionPhase::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionPhase::Closed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Authenticating) | (Connecting, Ready) => true,
            (Authenticating, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Ready => "ready",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}
