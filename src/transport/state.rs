//! Connection state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection state of a probe or NAT agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// A probe in this state must not be started again
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Checking | ConnectionState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
