//! Typed notification registry used by the session layer.
//!
//! Each event kind gets its own [`Observable`]: a table of synchronous
//! listeners plus a broadcast channel for async consumers. Listener tables are
//! snapshotted before dispatch, so registering or removing a listener from
//! inside a callback only affects later emissions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

const STREAM_DEPTH: usize = 64;

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by [`Observable::on`]. Unique across every observable in
/// the process, so one `off` call can be tried against several tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observable<T> {
    listeners: RwLock<Vec<(ListenerId, Listener<T>)>>,
    stream: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            stream: broadcast::channel(STREAM_DEPTH).0,
        }
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` when the id is not registered here.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        guard.len() != before
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
        // No receivers is the common case.
        let _ = self.stream.send(value.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.stream.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl<T: Clone + Send + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emit_reaches_every_listener() {
        let bus: Observable<u32> = Observable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.on(move |value| seen.lock().push(format!("{tag}{value}")));
        }
        bus.emit(&7);
        assert_eq!(*seen.lock(), vec!["a7".to_string(), "b7".to_string()]);
    }

    #[test]
    fn listener_added_during_emit_waits_for_next_pass() {
        let bus: Arc<Observable<u32>> = Arc::new(Observable::new());
        let late_calls = Arc::new(Mutex::new(0u32));
        let registered = Arc::new(Mutex::new(false));
        {
            let bus_inner = Arc::clone(&bus);
            let late_calls = Arc::clone(&late_calls);
            let registered = Arc::clone(&registered);
            bus.on(move |_| {
                let mut done = registered.lock();
                if !*done {
                    *done = true;
                    let late_calls = Arc::clone(&late_calls);
                    bus_inner.on(move |_| *late_calls.lock() += 1);
                }
            });
        }
        bus.emit(&1);
        assert_eq!(*late_calls.lock(), 0);
        bus.emit(&2);
        assert_eq!(*late_calls.lock(), 1);
    }

    #[test]
    fn listener_removed_during_emit_still_runs_this_pass() {
        let bus: Arc<Observable<u32>> = Arc::new(Observable::new());
        let second_calls = Arc::new(Mutex::new(0u32));
        let second_id = Arc::new(Mutex::new(None));
        {
            let bus_inner = Arc::clone(&bus);
            let second_id = Arc::clone(&second_id);
            bus.on(move |_| {
                if let Some(id) = second_id.lock().take() {
                    assert!(bus_inner.off(id));
                }
            });
        }
        let id = {
            let second_calls = Arc::clone(&second_calls);
            bus.on(move |_| *second_calls.lock() += 1)
        };
        *second_id.lock() = Some(id);

        bus.emit(&1);
        assert_eq!(*second_calls.lock(), 1);
        bus.emit(&2);
        assert_eq!(*second_calls.lock(), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn off_unknown_id_is_false() {
        let first: Observable<u32> = Observable::new();
        let second: Observable<u32> = Observable::new();
        let id = first.on(|_| {});
        assert!(!second.off(id));
        assert!(first.off(id));
        assert!(!first.off(id));
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_values() {
        let bus: Observable<&'static str> = Observable::new();
        let mut rx = bus.subscribe();
        bus.emit(&"connected");
        assert_eq!(rx.recv().await.expect("receive ok"), "connected");
    }
}
