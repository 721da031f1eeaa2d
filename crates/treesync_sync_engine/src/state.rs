//! Connection states and sync statistics.

use std::fmt;
use std::time::{Duration, Instant};

/// The state of a connection's sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Establishing a session with the authority.
    Connecting,
    /// Installing subscriptions and reconciling.
    Subscribing,
    /// Pulling and pushing changes.
    Syncing,
    /// In sync; waiting for the next trigger.
    Steady,
    /// Stopped after an authentication or protocol failure.
    Error,
    /// Shut down.
    Closed,
}

impl ConnectionState {
    /// Returns true if the engine is exchanging messages.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Subscribing | ConnectionState::Syncing
        )
    }

    /// Returns true if the engine will never sync again.
    pub fn is_final(&self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Steady => "steady",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of remote changes pulled.
    pub changes_pulled: u64,
    /// Total number of local changes pushed.
    pub changes_pushed: u64,
    /// Total number of conflicts resolved.
    pub conflicts_resolved: u64,
    /// Sessions opened, including the first.
    pub sessions: u64,
    /// Total number of failed cycles that were retried.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Remote changes pulled.
    pub pulled: u64,
    /// Local changes pushed.
    pub pushed: u64,
    /// Conflicts resolved while applying remote changes.
    pub conflicts: u64,
    /// Whether the cycle had to open a new session.
    pub reconnected: bool,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_classification() {
        assert!(ConnectionState::Syncing.is_active());
        assert!(!ConnectionState::Steady.is_active());
        assert!(ConnectionState::Error.is_final());
        assert!(ConnectionState::Closed.is_final());
        assert!(!ConnectionState::Connecting.is_final());
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Subscribing.to_string(), "subscribing");
    }
}
