//! Protocol side of a session: handshake, periodic resync, inbound dispatch
//! and broadcasting local document updates.
//!
//! The handler never reconnects on its own. It is told when a channel opens
//! or closes (by [`ConnectionManager`](crate::ConnectionManager), or directly
//! by an embedding server) and keeps the sync protocol consistent across
//! those transitions.
//!
//! Every entry point runs as one turn under a re-entrant lock. Turns from
//! different threads are serialized; a hook that calls back into the handler
//! from inside a turn proceeds on the same thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::document::{Document, DocumentEvent, Origin, SessionId, SyncProtocol, SyncStep};
use crate::error::SessionError;
use crate::frame::{self, start_frame, Decoder, MessageType};
use crate::state::{SessionSnapshot, SharedState};
use crate::transport::{Channel, CloseEvent};

pub type SyncedHook = Arc<dyn Fn() + Send + Sync>;
/// Receives the close event and the state as it was before the close.
pub type ReconnectHook = Arc<dyn Fn(&CloseEvent, &SessionSnapshot) + Send + Sync>;
pub type DestroyedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerHooks {
    pub on_synced: Option<SyncedHook>,
    pub on_attempt_reconnect: Option<ReconnectHook>,
    /// Replaces the default reaction to document destruction, which is to
    /// destroy the handler.
    pub on_document_destroyed: Option<DestroyedHook>,
}

#[derive(Clone, Default)]
pub struct HandlerOptions {
    pub prefix: Option<u64>,
    pub resync_interval: Option<Duration>,
    pub hooks: HandlerHooks,
}

impl HandlerOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            prefix: config.prefix,
            resync_interval: config.resync_interval(),
            hooks: HandlerHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: HandlerHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Cheap to clone; clones drive the same session.
pub struct SessionHandler<P: SyncProtocol> {
    inner: Arc<HandlerInner<P>>,
}

impl<P: SyncProtocol> Clone for SessionHandler<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HandlerInner<P: SyncProtocol> {
    id: SessionId,
    doc: Arc<P::Document>,
    protocol: P,
    state: SharedState,
    prefix: Option<u64>,
    hooks: HandlerHooks,
    turn: ReentrantMutex<()>,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: SyncProtocol> SessionHandler<P> {
    /// Subscribes to the document and starts the resync timer. Must be
    /// called inside a tokio runtime.
    pub fn new(doc: Arc<P::Document>, protocol: P, state: SharedState, options: HandlerOptions) -> Self {
        let updates = doc.subscribe();
        let inner = Arc::new(HandlerInner {
            id: SessionId::new(),
            doc,
            protocol,
            state,
            prefix: options.prefix,
            hooks: options.hooks,
            turn: ReentrantMutex::new(()),
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(listen_document(Arc::downgrade(&inner), updates))];
        if let Some(period) = options.resync_interval {
            tasks.push(tokio::spawn(resync_periodically(Arc::downgrade(&inner), period)));
        }
        *inner.tasks.lock() = tasks;

        Self { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    pub fn document(&self) -> &Arc<P::Document> {
        &self.inner.doc
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Call once per successful channel establishment.
    pub fn handle_open(&self, channel: Arc<dyn Channel>) {
        self.inner.handle_open(channel);
    }

    /// Call once per channel loss, including attempts that never opened.
    pub fn handle_close(&self, event: CloseEvent) {
        self.inner.handle_close(event);
    }

    pub fn handle_message(&self, bytes: &[u8]) {
        self.inner.handle_message(bytes);
    }

    /// Re-sends handshake step 1. No-op while disconnected.
    pub fn resync(&self) {
        self.inner.resync();
    }

    /// Sends a complete frame on the channel (if any) and to the side channel.
    pub fn broadcast(&self, frame: Bytes) {
        self.inner.broadcast(frame);
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<P: SyncProtocol> HandlerInner<P> {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn handle_open(&self, channel: Arc<dyn Channel>) {
        let _turn = self.turn.lock();
        if self.is_destroyed() {
            return;
        }
        let channel_id = channel.id();
        self.state.mark_open(channel);
        debug!(
            target = "tether::session",
            session = %self.id,
            %channel_id,
            "channel open; starting handshake"
        );
        self.resync();
    }

    fn handle_close(&self, event: CloseEvent) {
        let _turn = self.turn.lock();
        if self.is_destroyed() {
            return;
        }
        let before = self.state.snapshot();
        debug!(
            target = "tether::session",
            session = %self.id,
            kind = ?event.kind,
            code = ?event.code,
            reason = %event.reason,
            was_connected = before.connected,
            "channel closed"
        );
        // The hook must observe the pre-close flags.
        if let Some(hook) = &self.hooks.on_attempt_reconnect {
            hook(&event, &before);
        }
        self.state.mark_closed();
    }

    fn resync(&self) {
        let _turn = self.turn.lock();
        if self.is_destroyed() {
            return;
        }
        let Some(channel) = self.state.channel() else {
            return;
        };
        let (mut frame, _) = start_frame(self.prefix, MessageType::Sync);
        self.protocol.write_step1(&self.doc, &mut frame);
        send_frame(channel.as_ref(), Bytes::from(frame));
    }

    fn handle_message(&self, bytes: &[u8]) {
        let _turn = self.turn.lock();
        if self.is_destroyed() {
            return;
        }
        if let Err(err) = self.process_frame(bytes) {
            warn!(
                target = "tether::session",
                session = %self.id,
                len = bytes.len(),
                error = %err,
                "dropping inbound frame"
            );
            self.doc.report_error(&err);
        }
    }

    fn process_frame(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut decoder = Decoder::new(bytes);
        match frame::read_header(&mut decoder, self.prefix)? {
            MessageType::Sync => {
                let (mut reply, header_len) = start_frame(self.prefix, MessageType::Sync);
                let step = self.protocol.read_message(
                    &self.doc,
                    &mut decoder,
                    &mut reply,
                    Origin::Session(self.id),
                )?;
                if step == SyncStep::Step2 && self.state.mark_synced() {
                    info!(target = "tether::session", session = %self.id, "session synced");
                    if let Some(hook) = &self.hooks.on_synced {
                        hook();
                    }
                }
                if reply.len() > header_len {
                    if let Some(channel) = self.state.channel() {
                        send_frame(channel.as_ref(), Bytes::from(reply));
                    }
                }
            }
        }
        Ok(())
    }

    fn broadcast_update(&self, update: &[u8], origin: Origin) {
        if origin == Origin::Session(self.id) {
            return;
        }
        let (mut frame, _) = start_frame(self.prefix, MessageType::Sync);
        self.protocol.write_update(update, &mut frame);
        self.broadcast(Bytes::from(frame));
    }

    fn broadcast(&self, frame: Bytes) {
        let _turn = self.turn.lock();
        if self.is_destroyed() {
            return;
        }
        if let Some(channel) = self.state.channel() {
            send_frame(channel.as_ref(), frame.clone());
        }
        if let Some(side_channel) = self.state.on_broadcast() {
            side_channel(&self.state.snapshot(), &frame);
        }
    }

    fn document_destroyed(&self) {
        info!(target = "tether::session", session = %self.id, "document destroyed; releasing session");
        match &self.hooks.on_document_destroyed {
            Some(hook) => hook(),
            None => self.destroy(),
        }
    }

    fn destroy(&self) {
        let _turn = self.turn.lock();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(target = "tether::session", session = %self.id, "session handler destroyed");
    }
}

impl<P: SyncProtocol> Drop for HandlerInner<P> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn send_frame(channel: &dyn Channel, frame: Bytes) {
    if let Err(err) = channel.send(frame) {
        debug!(
            target = "tether::session",
            channel_id = %channel.id(),
            error = %err,
            "outbound frame dropped"
        );
    }
}

async fn listen_document<P: SyncProtocol>(
    handler: Weak<HandlerInner<P>>,
    mut events: broadcast::Receiver<DocumentEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(inner) = handler.upgrade() else {
            return;
        };
        match event {
            Ok(DocumentEvent::Update { update, origin }) => inner.broadcast_update(&update, origin),
            Ok(DocumentEvent::Destroyed) => {
                inner.document_destroyed();
                return;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    target = "tether::session",
                    session = %inner.id,
                    skipped,
                    "document stream lagged; forcing resync"
                );
                inner.resync();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn resync_periodically<P: SyncProtocol>(handler: Weak<HandlerInner<P>>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = handler.upgrade() else {
            return;
        };
        inner.resync();
    }
}
