//! Append-only entry log with a minimal sync protocol.
//!
//! Small enough to reason about in tests and demos while still exercising a
//! real handshake:
//!
//! - step 1: `[0] [varint known_len]`
//! - step 2: `[1] [varint start] [varint count] [var bytes entry]*`
//! - update: `[2] [var bytes ([varint index] [var bytes entry])]`
//!
//! Entries are positional; an entry at an index the journal already holds is
//! skipped, and one past the end is rejected as a gap (the next resync fills
//! it). The journal assumes one writer per index.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::document::{Document, DocumentEvent, Origin, SyncProtocol, SyncStep};
use crate::error::{FrameError, ProtocolError, SessionError};
use crate::frame::{write_var_bytes, write_var_u64, Decoder};

const EVENT_DEPTH: usize = 256;

const STEP1: u64 = 0;
const STEP2: u64 = 1;
const UPDATE: u64 = 2;

#[derive(Debug)]
pub struct JournalDocument {
    entries: RwLock<Vec<Bytes>>,
    events: broadcast::Sender<DocumentEvent>,
    errors: Mutex<Vec<String>>,
}

impl JournalDocument {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            events: broadcast::channel(EVENT_DEPTH).0,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Appends a local entry and returns its index.
    pub fn append(&self, entry: impl Into<Bytes>) -> u64 {
        let entry = entry.into();
        let index = {
            let mut entries = self.entries.write();
            entries.push(entry.clone());
            entries.len() as u64 - 1
        };
        self.publish(index, &entry, Origin::Local);
        index
    }

    pub fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<Bytes> {
        self.entries.read().clone()
    }

    pub fn entries_from(&self, start: u64) -> Vec<Bytes> {
        let entries = self.entries.read();
        let start = usize::try_from(start).unwrap_or(usize::MAX).min(entries.len());
        entries[start..].to_vec()
    }

    /// Applies `entries` as positions `start..`. Returns how many were new.
    pub fn apply(&self, start: u64, entries: Vec<Bytes>, origin: Origin) -> Result<usize, ProtocolError> {
        let mut appended = Vec::new();
        {
            let mut log = self.entries.write();
            let len = log.len() as u64;
            if start > len {
                return Err(ProtocolError::Rejected(format!(
                    "gap: entries start at {start}, journal holds {len}"
                )));
            }
            for (offset, entry) in entries.into_iter().enumerate() {
                let index = start + offset as u64;
                if index < log.len() as u64 {
                    continue;
                }
                log.push(entry.clone());
                appended.push((index, entry));
            }
        }
        for (index, entry) in &appended {
            self.publish(*index, entry, origin);
        }
        Ok(appended.len())
    }

    /// Announces destruction to every subscriber.
    pub fn destroy(&self) {
        let _ = self.events.send(DocumentEvent::Destroyed);
    }

    /// Errors reported by sessions, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    fn publish(&self, index: u64, entry: &[u8], origin: Origin) {
        let _ = self.events.send(DocumentEvent::Update {
            update: encode_update(index, entry),
            origin,
        });
    }
}

impl Default for JournalDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for JournalDocument {
    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    fn report_error(&self, error: &SessionError) {
        self.errors.lock().push(error.to_string());
    }
}

pub fn encode_update(index: u64, entry: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(entry.len() + 10);
    write_var_u64(&mut buf, index);
    write_var_bytes(&mut buf, entry);
    Bytes::from(buf)
}

pub fn decode_update(update: &[u8]) -> Result<(u64, Bytes), FrameError> {
    let mut decoder = Decoder::new(update);
    let index = decoder.read_var_u64()?;
    let entry = Bytes::copy_from_slice(decoder.read_var_bytes()?);
    decoder.finish()?;
    Ok((index, entry))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JournalProtocol;

impl JournalProtocol {
    fn write_step2(doc: &JournalDocument, known: u64, out: &mut Vec<u8>) {
        let start = known.min(doc.len());
        let missing = doc.entries_from(start);
        write_var_u64(out, STEP2);
        write_var_u64(out, start);
        write_var_u64(out, missing.len() as u64);
        for entry in &missing {
            write_var_bytes(out, entry);
        }
    }
}

impl SyncProtocol for JournalProtocol {
    type Document = JournalDocument;

    fn write_step1(&self, doc: &JournalDocument, out: &mut Vec<u8>) {
        write_var_u64(out, STEP1);
        write_var_u64(out, doc.len());
    }

    fn write_update(&self, update: &[u8], out: &mut Vec<u8>) {
        write_var_u64(out, UPDATE);
        write_var_bytes(out, update);
    }

    fn read_message(
        &self,
        doc: &JournalDocument,
        input: &mut Decoder<'_>,
        reply: &mut Vec<u8>,
        origin: Origin,
    ) -> Result<SyncStep, ProtocolError> {
        match input.read_var_u64()? {
            STEP1 => {
                let known = input.read_var_u64()?;
                input.finish()?;
                Self::write_step2(doc, known, reply);
                Ok(SyncStep::Step1)
            }
            STEP2 => {
                let start = input.read_var_u64()?;
                let count = input.read_var_u64()?;
                let capacity = usize::try_from(count).unwrap_or(usize::MAX).min(input.remaining());
                let mut entries = Vec::with_capacity(capacity);
                for _ in 0..count {
                    entries.push(Bytes::copy_from_slice(input.read_var_bytes()?));
                }
                input.finish()?;
                doc.apply(start, entries, origin)?;
                Ok(SyncStep::Step2)
            }
            UPDATE => {
                let update = input.read_var_bytes()?;
                input.finish()?;
                let (index, entry) = decode_update(update)?;
                doc.apply(index, vec![entry], origin)?;
                Ok(SyncStep::Update)
            }
            other => Err(ProtocolError::UnknownStep(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SessionId;

    fn exchange(from: &JournalDocument, to: &JournalDocument) -> SyncStep {
        let mut step1 = Vec::new();
        JournalProtocol.write_step1(to, &mut step1);

        let mut step2 = Vec::new();
        let step = JournalProtocol
            .read_message(from, &mut Decoder::new(&step1), &mut step2, Origin::Local)
            .expect("step1 ok");
        assert_eq!(step, SyncStep::Step1);

        let mut reply = Vec::new();
        let step = JournalProtocol
            .read_message(to, &mut Decoder::new(&step2), &mut reply, Origin::Local)
            .expect("step2 ok");
        assert!(reply.is_empty());
        step
    }

    #[test]
    fn handshake_copies_missing_entries() {
        let remote = JournalDocument::new();
        remote.append("a");
        remote.append("b");
        remote.append("c");
        let local = JournalDocument::new();
        local.append("a");

        assert_eq!(exchange(&remote, &local), SyncStep::Step2);
        assert_eq!(local.entries(), remote.entries());
    }

    #[test]
    fn handshake_with_peer_ahead_sends_nothing() {
        let remote = JournalDocument::new();
        let local = JournalDocument::new();
        local.append("x");
        assert_eq!(exchange(&remote, &local), SyncStep::Step2);
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn update_applies_at_index_and_skips_duplicates() {
        let doc = JournalDocument::new();
        let origin = Origin::Session(SessionId::new());
        let mut frame = Vec::new();
        JournalProtocol.write_update(&encode_update(0, b"first"), &mut frame);

        for _ in 0..2 {
            let mut reply = Vec::new();
            let step = JournalProtocol
                .read_message(&doc, &mut Decoder::new(&frame), &mut reply, origin)
                .expect("update ok");
            assert_eq!(step, SyncStep::Update);
        }
        assert_eq!(doc.entries(), vec![Bytes::from_static(b"first")]);
    }

    #[test]
    fn update_past_end_is_a_gap() {
        let doc = JournalDocument::new();
        let mut frame = Vec::new();
        JournalProtocol.write_update(&encode_update(3, b"late"), &mut frame);
        let err = JournalProtocol
            .read_message(&doc, &mut Decoder::new(&frame), &mut Vec::new(), Origin::Local)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected(_)));
        assert!(doc.is_empty());
    }

    #[test]
    fn unknown_step_is_rejected() {
        let doc = JournalDocument::new();
        let err = JournalProtocol
            .read_message(&doc, &mut Decoder::new(&[9]), &mut Vec::new(), Origin::Local)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownStep(9)));
    }

    #[tokio::test]
    async fn remote_entries_are_published_with_origin() {
        let doc = JournalDocument::new();
        let mut events = doc.subscribe();
        let origin = Origin::Session(SessionId::new());
        doc.apply(0, vec![Bytes::from_static(b"r")], origin)
            .expect("apply ok");
        let event = events.recv().await.expect("event");
        assert_eq!(
            event,
            DocumentEvent::Update {
                update: encode_update(0, b"r"),
                origin
            }
        );
    }
}
