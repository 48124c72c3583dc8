//! Shared session state and the only transitions allowed on it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{Channel, ChannelId};

/// Side-channel fan-out invoked with every broadcast frame.
pub type BroadcastFn = Arc<dyn Fn(&SessionSnapshot, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub channel: Option<ChannelId>,
    pub connected: bool,
    pub synced: bool,
    pub unsuccessful_reconnects: u32,
}

#[derive(Default)]
struct SessionState {
    channel: Option<Arc<dyn Channel>>,
    connected: bool,
    synced: bool,
    unsuccessful_reconnects: u32,
    on_broadcast: Option<BroadcastFn>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel: self.channel.as_ref().map(|channel| channel.id()),
            connected: self.connected,
            synced: self.synced,
            unsuccessful_reconnects: self.unsuccessful_reconnects,
        }
    }
}

/// Handle to the state one manager and its handler share.
///
/// The lock is held only inside these methods, never while a callback runs.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn is_synced(&self) -> bool {
        self.inner.lock().synced
    }

    pub fn unsuccessful_reconnects(&self) -> u32 {
        self.inner.lock().unsuccessful_reconnects
    }

    /// The open channel, if any.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.lock().channel.clone()
    }

    pub fn set_on_broadcast(&self, callback: Option<BroadcastFn>) {
        self.inner.lock().on_broadcast = callback;
    }

    pub fn on_broadcast(&self) -> Option<BroadcastFn> {
        self.inner.lock().on_broadcast.clone()
    }

    /// A channel confirmed open: it becomes the session channel and the
    /// failure counter starts over.
    pub fn mark_open(&self, channel: Arc<dyn Channel>) {
        let mut state = self.inner.lock();
        state.channel = Some(channel);
        state.connected = true;
        state.synced = false;
        state.unsuccessful_reconnects = 0;
    }

    pub fn mark_closed(&self) {
        let mut state = self.inner.lock();
        state.channel = None;
        state.connected = false;
        state.synced = false;
    }

    /// Returns `true` only for the unsynced → synced transition. A
    /// disconnected session cannot become synced.
    pub fn mark_synced(&self) -> bool {
        let mut state = self.inner.lock();
        if !state.connected || state.synced {
            return false;
        }
        state.synced = true;
        true
    }

    /// Counts one more failed attempt and returns the count before it, which
    /// is the value the next reconnect delay is computed from.
    pub fn record_failed_attempt(&self) -> u32 {
        let mut state = self.inner.lock();
        let previous = state.unsuccessful_reconnects;
        state.unsuccessful_reconnects = previous.saturating_add(1);
        previous
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedState").field(&self.snapshot()).finish()
    }
}
