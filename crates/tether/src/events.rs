use std::fmt;

use tether_bus::{ListenerId, Observable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
}

/// Handshake completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synced;

/// Position in the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Synced,
}

/// One registration table per event kind.
#[derive(Debug, Default)]
pub struct SessionEvents {
    pub status: Observable<StatusEvent>,
    pub synced: Observable<Synced>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a listener from whichever table holds it.
    pub fn off(&self, id: ListenerId) -> bool {
        self.status.off(id) || self.synced.off(id)
    }

    pub(crate) fn emit_status(&self, status: ConnectionStatus) {
        self.status.emit(&StatusEvent { status });
    }
}
