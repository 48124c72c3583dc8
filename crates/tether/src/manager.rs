//! Keeps one channel pointed at a fixed endpoint and recovers it with a
//! logarithmic backoff when it drops.
//!
//! All socket notifications flow through a single queue drained by one pump
//! task, so for a given manager they are handled one at a time and in order.
//! Notifications from a channel that has since been replaced are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_bus::ListenerId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::document::{SessionId, SyncProtocol};
use crate::events::{ConnectionStatus, SessionEvents, SessionPhase, StatusEvent, Synced};
use crate::handler::{HandlerHooks, HandlerOptions, SessionHandler};
use crate::state::{BroadcastFn, SessionSnapshot, SharedState};
use crate::transport::{Channel, ChannelId, CloseEvent, Connector, SocketEvent, SocketNotice, SocketSink};

/// Decides whether a closed channel should be replaced. Returning `false`
/// stops the manager for good (until [`ConnectionManager::connect`]).
pub type ReconnectPredicate = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

pub struct ConnectionManagerBuilder<P: SyncProtocol> {
    doc: Arc<P::Document>,
    protocol: P,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    should_reconnect: Option<ReconnectPredicate>,
    on_broadcast: Option<BroadcastFn>,
}

impl<P: SyncProtocol> ConnectionManagerBuilder<P> {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn should_reconnect<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.should_reconnect = Some(Arc::new(predicate));
        self
    }

    /// Side channel that sees every broadcast frame, connected or not.
    pub fn on_broadcast<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionSnapshot, &[u8]) + Send + Sync + 'static,
    {
        self.on_broadcast = Some(Arc::new(callback));
        self
    }

    /// Starts the manager and its first connection attempt. Must be called
    /// inside a tokio runtime.
    pub fn build(self) -> ConnectionManager<P> {
        let Self {
            doc,
            protocol,
            connector,
            config,
            should_reconnect,
            on_broadcast,
        } = self;

        let state = SharedState::new();
        state.set_on_broadcast(on_broadcast);
        let (notices, queue) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner<P>>| {
            let hooks = HandlerHooks {
                on_synced: Some(Arc::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(manager) = weak.upgrade() {
                            manager.events.synced.emit(&Synced);
                        }
                    }
                })),
                on_attempt_reconnect: Some(Arc::new({
                    let weak = weak.clone();
                    move |event: &CloseEvent, _before: &SessionSnapshot| {
                        if let Some(manager) = weak.upgrade() {
                            manager.attempt_reconnect(event);
                        }
                    }
                })),
                on_document_destroyed: Some(Arc::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(manager) = weak.upgrade() {
                            manager.destroy();
                        }
                    }
                })),
            };
            let options = HandlerOptions::from_config(&config).with_hooks(hooks);
            let handler = SessionHandler::new(doc, protocol, state.clone(), options);

            ManagerInner {
                connector,
                handler,
                state,
                events: SessionEvents::new(),
                backoff: config.backoff(),
                should_reconnect,
                notices,
                link: Mutex::new(Link {
                    next_id: 0,
                    current: None,
                    should_connect: true,
                    vetoed: false,
                    reconnect_timer: None,
                    tasks: Vec::new(),
                }),
                message_timeout: config.message_timeout(),
                last_message: Mutex::new(Instant::now()),
                destroyed: AtomicBool::new(false),
            }
        });

        let mut tasks = vec![tokio::spawn(pump(Arc::downgrade(&inner), queue))];
        if let Some(timeout) = inner.message_timeout {
            tasks.push(tokio::spawn(watch_liveness(Arc::downgrade(&inner), timeout)));
        }
        inner.link.lock().tasks = tasks;

        info!(
            target = "tether::manager",
            session = %inner.handler.id(),
            endpoint = %inner.connector.describe(),
            "connection manager started"
        );
        inner.connect_now();

        ConnectionManager { inner }
    }
}

/// Owns the session. Dropping it destroys it.
pub struct ConnectionManager<P: SyncProtocol> {
    inner: Arc<ManagerInner<P>>,
}

struct Link {
    next_id: u64,
    /// The one channel the manager considers live, open or still connecting.
    current: Option<Arc<dyn Channel>>,
    should_connect: bool,
    /// Set by a refused reconnect, consumed by the close that caused it.
    vetoed: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct ManagerInner<P: SyncProtocol> {
    connector: Arc<dyn Connector>,
    handler: SessionHandler<P>,
    state: SharedState,
    events: SessionEvents,
    backoff: Backoff,
    should_reconnect: Option<ReconnectPredicate>,
    notices: mpsc::UnboundedSender<SocketNotice>,
    link: Mutex<Link>,
    message_timeout: Option<Duration>,
    last_message: Mutex<Instant>,
    destroyed: AtomicBool,
}

impl<P: SyncProtocol> ConnectionManager<P> {
    pub fn builder(doc: Arc<P::Document>, protocol: P, connector: impl Connector) -> ConnectionManagerBuilder<P> {
        ConnectionManagerBuilder {
            doc,
            protocol,
            connector: Arc::new(connector),
            config: SessionConfig::default(),
            should_reconnect: None,
            on_broadcast: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.handler.id()
    }

    pub fn handler(&self) -> &SessionHandler<P> {
        &self.inner.handler
    }

    pub fn document(&self) -> &Arc<P::Document> {
        self.inner.handler.document()
    }

    pub fn events(&self) -> &SessionEvents {
        &self.inner.events
    }

    pub fn on_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.inner.events.status.on(listener)
    }

    pub fn on_synced<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Synced) + Send + Sync + 'static,
    {
        self.inner.events.synced.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.state.is_synced()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    /// Resolves once the session is synced. Returns immediately when it
    /// already is.
    pub async fn wait_synced(&self) {
        let mut synced = self.inner.events.synced.subscribe();
        loop {
            if self.is_synced() {
                return;
            }
            match synced.recv().await {
                Ok(Synced) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Closes the live channel and suspends reconnection until
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Resumes reconnection after [`disconnect`](Self::disconnect) or a
    /// vetoed close. No-op while a channel is live or a reconnect is pending.
    pub fn connect(&self) {
        self.inner.resume();
    }

    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<P: SyncProtocol> Drop for ConnectionManager<P> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<P: SyncProtocol> std::fmt::Debug for ConnectionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("session", &self.inner.handler.id())
            .field("phase", &self.inner.phase())
            .field("state", &self.inner.state)
            .finish()
    }
}

impl<P: SyncProtocol> ManagerInner<P> {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn phase(&self) -> SessionPhase {
        let snapshot = self.state.snapshot();
        if snapshot.synced {
            SessionPhase::Synced
        } else if snapshot.connected {
            SessionPhase::Connected
        } else if !self.is_destroyed() && self.link.lock().should_connect {
            SessionPhase::Connecting
        } else {
            SessionPhase::Disconnected
        }
    }

    /// Builds a channel for a fresh attempt. The link lock is held across
    /// `Connector::connect` so no notice for the new id is dispatched before
    /// the channel is recorded.
    fn connect_now(&self) {
        let mut link = self.link.lock();
        if self.is_destroyed() || !link.should_connect {
            return;
        }
        link.reconnect_timer = None;
        if let Some(stale) = link.current.take() {
            debug!(
                target = "tether::manager",
                channel_id = %stale.id(),
                "superseding live channel"
            );
            stale.close();
        }
        link.next_id += 1;
        let id = ChannelId(link.next_id);
        debug!(
            target = "tether::manager",
            channel_id = %id,
            attempt = self.state.unsuccessful_reconnects(),
            "connecting"
        );
        let sink = SocketSink::new(id, self.notices.clone());
        link.current = Some(self.connector.connect(id, sink));
    }

    fn dispatch(&self, notice: SocketNotice) {
        if self.is_destroyed() {
            return;
        }
        let channel = {
            let mut link = self.link.lock();
            match &link.current {
                Some(current) if current.id() == notice.channel => {
                    if matches!(notice.event, SocketEvent::Close(_)) {
                        link.current.take()
                    } else {
                        Some(Arc::clone(current))
                    }
                }
                _ => None,
            }
        };
        let Some(channel) = channel else {
            debug!(
                target = "tether::manager",
                channel_id = %notice.channel,
                "ignoring notice from superseded channel"
            );
            return;
        };

        match notice.event {
            SocketEvent::Open => {
                *self.last_message.lock() = Instant::now();
                info!(target = "tether::manager", channel_id = %notice.channel, "connected");
                self.handler.handle_open(channel);
                self.events.emit_status(ConnectionStatus::Connected);
            }
            SocketEvent::Message(bytes) => {
                *self.last_message.lock() = Instant::now();
                self.handler.handle_message(&bytes);
            }
            SocketEvent::Close(event) => {
                let was_connected = self.state.is_connected();
                self.handler.handle_close(event);
                let vetoed = std::mem::take(&mut self.link.lock().vetoed);
                // The connected -> disconnected transition is announced, and so
                // is a veto, which ends the manager.
                if was_connected || vetoed {
                    info!(target = "tether::manager", channel_id = %notice.channel, "disconnected");
                    self.events.emit_status(ConnectionStatus::Disconnected);
                }
            }
        }
    }

    /// Runs inside `handle_close`, before the session flags are cleared.
    fn attempt_reconnect(self: &Arc<Self>, event: &CloseEvent) {
        if self.is_destroyed() || !self.link.lock().should_connect {
            return;
        }
        if let Some(predicate) = &self.should_reconnect {
            if !predicate(event) {
                warn!(
                    target = "tether::manager",
                    kind = ?event.kind,
                    code = ?event.code,
                    "reconnect vetoed; manager stopped"
                );
                let mut link = self.link.lock();
                link.should_connect = false;
                link.vetoed = true;
                return;
            }
        }
        let attempts = self.state.record_failed_attempt();
        let delay = self.backoff.delay(attempts);
        info!(
            target = "tether::manager",
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            reason = %event.reason,
            "scheduling reconnect"
        );
        self.schedule_connect(delay);
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let mut link = self.link.lock();
        if self.is_destroyed() {
            return;
        }
        if let Some(previous) = link.reconnect_timer.take() {
            previous.abort();
        }
        link.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.connect_now();
            }
        }));
    }

    fn disconnect(&self) {
        let channel = {
            let mut link = self.link.lock();
            link.should_connect = false;
            if let Some(timer) = link.reconnect_timer.take() {
                timer.abort();
            }
            link.current.clone()
        };
        info!(target = "tether::manager", "disconnect requested");
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn resume(&self) {
        {
            let mut link = self.link.lock();
            if self.is_destroyed() {
                return;
            }
            let busy = link.current.is_some() || link.reconnect_timer.is_some();
            link.should_connect = true;
            // A channel still closing reconnects through the normal close path.
            if busy {
                return;
            }
        }
        self.connect_now();
    }

    fn check_liveness(&self, timeout: Duration) {
        if !self.state.is_connected() {
            return;
        }
        let idle = self.last_message.lock().elapsed();
        if idle < timeout {
            return;
        }
        let channel = self.link.lock().current.clone();
        if let Some(channel) = channel {
            warn!(
                target = "tether::manager",
                channel_id = %channel.id(),
                idle_ms = idle.as_millis() as u64,
                "no traffic within message timeout; closing channel"
            );
            channel.close();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (channel, timer, tasks) = {
            let mut link = self.link.lock();
            link.should_connect = false;
            (
                link.current.take(),
                link.reconnect_timer.take(),
                std::mem::take(&mut link.tasks),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        for task in tasks {
            task.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }

        let was_connected = self.state.is_connected();
        self.handler.destroy();
        self.state.mark_closed();
        if was_connected {
            self.events.emit_status(ConnectionStatus::Disconnected);
        }
        info!(target = "tether::manager", session = %self.handler.id(), "connection manager destroyed");
    }
}

async fn pump<P: SyncProtocol>(manager: Weak<ManagerInner<P>>, mut queue: mpsc::UnboundedReceiver<SocketNotice>) {
    while let Some(notice) = queue.recv().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        inner.dispatch(notice);
    }
}

async fn watch_liveness<P: SyncProtocol>(manager: Weak<ManagerInner<P>>, timeout: Duration) {
    let period = (timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(period).await;
        let Some(inner) = manager.upgrade() else {
            return;
        };
        inner.check_liveness(timeout);
    }
}
