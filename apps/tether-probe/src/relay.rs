//! WebSocket relay: one shared journal, one session handler per connection.
//! Updates applied from one connection are broadcast to all the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tether::journal::{JournalDocument, JournalProtocol};
use tether::transport::{ChannelId, Outbound, QueueChannel};
use tether::{CloseEvent, HandlerOptions, SessionConfig, SessionHandler, SharedState};
use tracing::{debug, info, warn};

use crate::cli::RelayArgs;

#[derive(Clone)]
struct RelayState {
    doc: Arc<JournalDocument>,
    options: HandlerOptions,
    next_channel: Arc<AtomicU64>,
}

pub async fn run(args: RelayArgs) -> Result<()> {
    let config: SessionConfig = args.session.load()?;
    let state = RelayState {
        doc: Arc::new(JournalDocument::new()),
        options: HandlerOptions::from_config(&config),
        next_channel: Arc::new(AtomicU64::new(1)),
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(addr = %args.bind, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server failed")
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let id = ChannelId(state.next_channel.fetch_add(1, Ordering::Relaxed));
    let (channel, mut outbound) = QueueChannel::new(id);
    let handler = SessionHandler::new(
        Arc::clone(&state.doc),
        JournalProtocol,
        SharedState::new(),
        state.options.clone(),
    );
    info!(channel_id = %id, session = %handler.id(), "peer joined");
    handler.handle_open(Arc::new(channel));

    let (mut sender, mut receiver) = socket.split();
    let close = loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = sender.send(Message::Binary(frame.to_vec())).await {
                        break CloseEvent::error(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break CloseEvent::local();
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Binary(data))) => handler.handle_message(&data),
                Some(Ok(Message::Close(frame))) => {
                    break CloseEvent::remote(frame.as_ref().map(|frame| frame.code), "peer closed");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(channel_id = %id, error = %err, "websocket error");
                    break CloseEvent::error(err.to_string());
                }
                None => break CloseEvent::remote(None, "stream ended"),
            },
        }
    };

    debug!(channel_id = %id, kind = ?close.kind, "peer left");
    handler.handle_close(close);
    handler.destroy();
    info!(channel_id = %id, entries = state.doc.len(), "session released");
}
