//! In-process connector for tests and demos.
//!
//! Every `connect` hands a [`MemoryPeer`] to the paired [`MemoryListener`];
//! the test plays the remote side: it decides when the channel opens, what it
//! receives and how it closes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Channel, ChannelId, CloseEvent, Connector, SocketSink};
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    attempts: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accepted: tx,
                attempts: Arc::clone(&attempts),
            },
            MemoryListener {
                accepted: rx,
                attempts,
            },
        )
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, id: ChannelId, sink: SocketSink) -> Arc<dyn Channel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let channel = MemoryChannel {
            id,
            sink: sink.clone(),
            frames: frames_tx,
            closed: Arc::clone(&closed),
        };
        let _ = self.accepted.send(MemoryPeer {
            id,
            sink,
            frames: frames_rx,
            closed,
        });
        Arc::new(channel)
    }

    fn describe(&self) -> String {
        String::from("memory")
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.try_recv().ok()
    }

    /// Number of channels constructed so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryChannel {
    id: ChannelId,
    sink: SocketSink,
    frames: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.close(CloseEvent::local());
        }
    }
}

/// Remote end of one memory channel.
#[derive(Debug)]
pub struct MemoryPeer {
    id: ChannelId,
    sink: SocketSink,
    frames: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn open(&self) {
        self.sink.open();
    }

    pub fn deliver(&self, frame: impl Into<Bytes>) {
        self.sink.message(frame.into());
    }

    /// Closes from the remote side.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.close(CloseEvent::remote(code, reason));
        }
    }

    /// Reports the attempt as never having opened.
    pub fn fail(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.close(CloseEvent::failed(reason));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next frame the session sent. `None` once the session side dropped the
    /// channel and everything queued was read.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.frames.try_recv().ok()
    }

    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
