use thiserror::Error;

/// Failure while decoding a frame or a varint-encoded field inside one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("frame prefix mismatch: expected {expected}, found {found}")]
    PrefixMismatch { expected: u64, found: u64 },
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

/// Failure reported by a [`SyncProtocol`](crate::SyncProtocol) while reading a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("decode failed: {0}")]
    Decode(#[from] FrameError),
    #[error("unknown sync step: {0}")]
    UnknownStep(u64),
    #[error("update rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
}

/// Error surfaced to the document when an inbound frame is dropped.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{0} is required")]
    Missing(&'static str),
}
