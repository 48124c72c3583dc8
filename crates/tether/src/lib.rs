//! Self-healing transport session for a replicated document.
//!
//! [`SessionHandler`] speaks the sync protocol over whatever channel it is
//! given; [`ConnectionManager`] keeps a channel alive against one endpoint and
//! drives the handler through open and close transitions, reconnecting with a
//! capped logarithmic backoff.

pub mod backoff;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod frame;
pub mod handler;
pub mod journal;
pub mod manager;
pub mod state;
pub mod transport;

pub use backoff::Backoff;
pub use config::SessionConfig;
pub use document::{Document, DocumentEvent, Origin, SessionId, SyncProtocol, SyncStep};
pub use error::{ConfigError, FrameError, ProtocolError, SessionError, TransportError};
pub use events::{ConnectionStatus, SessionEvents, SessionPhase, StatusEvent, Synced};
pub use handler::{HandlerHooks, HandlerOptions, SessionHandler};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ReconnectPredicate};
pub use state::{SessionSnapshot, SharedState};
pub use tether_bus::ListenerId;
pub use transport::websocket::{WebSocketConfig, WebSocketConfigBuilder, WebSocketConnector};
pub use transport::{Channel, ChannelId, CloseEvent, CloseKind, Connector};
