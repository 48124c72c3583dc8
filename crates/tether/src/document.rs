//! Seams to the replicated document and its synchronization protocol. The
//! session treats both as black boxes.

use std::fmt;

use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{ProtocolError, SessionError};
use crate::frame::Decoder;

/// Identity of one session handler; used as the origin of updates it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who caused a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Session(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// Encoded update, ready for [`SyncProtocol::write_update`].
    Update { update: Bytes, origin: Origin },
    Destroyed,
}

pub trait Document: Send + Sync + 'static {
    /// Stream of updates and the destruction notice. Subscribers only see
    /// events emitted after the call.
    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent>;

    /// An inbound frame could not be decoded or applied and was dropped.
    fn report_error(&self, error: &SessionError);
}

/// Classification of a consumed sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Peer announced its state; a step-2 reply was written.
    Step1,
    /// Handshake confirmation: the peer's missing state was applied.
    Step2,
    Update,
}

pub trait SyncProtocol: Send + Sync + 'static {
    type Document: Document;

    /// Appends a handshake-1 payload describing the local state.
    fn write_step1(&self, doc: &Self::Document, out: &mut Vec<u8>);

    fn write_update(&self, update: &[u8], out: &mut Vec<u8>);

    /// Consumes one sync payload, applying it to `doc` with `origin`. Reply
    /// bytes, if any, are appended to `reply`.
    fn read_message(
        &self,
        doc: &Self::Document,
        input: &mut Decoder<'_>,
        reply: &mut Vec<u8>,
        origin: Origin,
    ) -> Result<SyncStep, ProtocolError>;
}
