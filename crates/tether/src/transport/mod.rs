//! Socket abstraction consumed by the session layer.
//!
//! A [`Connector`] builds one [`Channel`] per connection attempt and reports
//! what happens to it through a [`SocketSink`]: at most one `Open`, any number
//! of `Message`s, then exactly one `Close`. Every notification carries the
//! [`ChannelId`] of the attempt, so the manager can discard anything from a
//! channel it has already replaced.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The peer closed the socket or the stream ended.
    Remote,
    /// Closed from this side.
    Local,
    /// The socket never opened.
    Failed,
    /// The socket broke while open.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub kind: CloseKind,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseEvent {
    pub fn remote(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::Remote,
            code,
            reason: reason.into(),
        }
    }

    pub fn local() -> Self {
        Self {
            kind: CloseKind::Local,
            code: None,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::Failed,
            code: None,
            reason: reason.into(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::Error,
            code: None,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(Bytes),
    Close(CloseEvent),
}

#[derive(Debug, Clone)]
pub struct SocketNotice {
    pub channel: ChannelId,
    pub event: SocketEvent,
}

/// Where a channel reports its lifecycle. Sends after the receiver is gone
/// are ignored.
#[derive(Debug, Clone)]
pub struct SocketSink {
    channel: ChannelId,
    tx: mpsc::UnboundedSender<SocketNotice>,
}

impl SocketSink {
    pub fn new(channel: ChannelId, tx: mpsc::UnboundedSender<SocketNotice>) -> Self {
        Self { channel, tx }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn open(&self) {
        self.notify(SocketEvent::Open);
    }

    pub fn message(&self, bytes: Bytes) {
        self.notify(SocketEvent::Message(bytes));
    }

    pub fn close(&self, event: CloseEvent) {
        self.notify(SocketEvent::Close(event));
    }

    fn notify(&self, event: SocketEvent) {
        let _ = self.tx.send(SocketNotice {
            channel: self.channel,
            event,
        });
    }
}

/// Outbound half of one connection attempt.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Requests a close. The matching `Close` notification still arrives
    /// through the sink.
    fn close(&self);
}

/// Builds channels. `connect` must not block: the returned channel is
/// "connecting" until the sink reports `Open`.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, id: ChannelId, sink: SocketSink) -> Arc<dyn Channel>;

    fn describe(&self) -> String {
        String::from("channel")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    Close,
}

/// Channel that queues outbound traffic for a task owning the real socket.
///
/// Used by the WebSocket connector and by servers that embed a
/// [`SessionHandler`](crate::SessionHandler) per accepted connection.
#[derive(Debug)]
pub struct QueueChannel {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: AtomicBool,
}

impl QueueChannel {
    pub fn new(id: ChannelId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                outbound: tx,
                closing: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl Channel for QueueChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.send(Outbound::Close);
    }
}
