//! Outer framing shared by every message on the channel:
//! `[optional varint prefix] [u8 message type] [payload]`.
//!
//! The prefix lets several logical topics share one physical socket. The
//! payload belongs to the sync protocol; [`Decoder`] and the `write_var_*`
//! helpers are exported so protocol implementations can use the same varint
//! encoding.

use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageType {
    Sync,
}

impl MessageType {
    pub const fn tag(self) -> u8 {
        match self {
            MessageType::Sync => 0,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0 => Ok(MessageType::Sync),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Starts a frame: prefix (when multiplexing) followed by the type tag.
pub fn write_header(buf: &mut Vec<u8>, prefix: Option<u64>, kind: MessageType) {
    if let Some(prefix) = prefix {
        write_var_u64(buf, prefix);
    }
    buf.push(kind.tag());
}

/// Allocates a buffer holding only the frame header. Returns the buffer and
/// the header length, so callers can tell whether a payload was appended.
pub fn start_frame(prefix: Option<u64>, kind: MessageType) -> (Vec<u8>, usize) {
    let mut buf = Vec::with_capacity(64);
    write_header(&mut buf, prefix, kind);
    let header_len = buf.len();
    (buf, header_len)
}

/// Reads the header of an inbound frame. When a prefix is configured the
/// frame must carry the same one.
pub fn read_header(decoder: &mut Decoder<'_>, prefix: Option<u64>) -> Result<MessageType, FrameError> {
    if let Some(expected) = prefix {
        let found = decoder.read_var_u64()?;
        if found != expected {
            return Err(FrameError::PrefixMismatch { expected, found });
        }
    }
    MessageType::from_tag(decoder.read_u8()?)
}

pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Length-prefixed byte string.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        if self.pos >= self.bytes.len() {
            return Err(FrameError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, FrameError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(FrameError::VarIntOverflow)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos.checked_add(len).ok_or(FrameError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(FrameError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| FrameError::InvalidData("length overflow"))?;
        self.read_bytes(len)
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless every byte was consumed.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FrameError::InvalidData("trailing bytes"))
        }
    }
}
