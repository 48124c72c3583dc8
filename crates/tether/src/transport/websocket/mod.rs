use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{Channel, ChannelId, CloseEvent, Connector, Outbound, QueueChannel, SocketSink};

pub mod config;
pub use config::{WebSocketConfig, WebSocketConfigBuilder};

/// Dials a fresh WebSocket per attempt and pumps it on its own task.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, id: ChannelId, sink: SocketSink) -> Arc<dyn Channel> {
        let (channel, outbound) = QueueChannel::new(id);
        let url = self.config.build_url();
        let connect_timeout = self.config.connect_timeout;
        tokio::spawn(run_socket(url, connect_timeout, outbound, sink));
        Arc::new(channel)
    }

    fn describe(&self) -> String {
        self.config.build_url()
    }
}

async fn run_socket(
    url: String,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sink: SocketSink,
) {
    let channel_id = sink.channel().0;
    let dial = timeout(connect_timeout, connect_async(url.as_str()));
    tokio::pin!(dial);

    // A close requested while dialing abandons the attempt.
    let ws_stream = loop {
        tokio::select! {
            result = &mut dial => match result {
                Ok(Ok((stream, _))) => break stream,
                Ok(Err(err)) => {
                    debug!(target = "tether::websocket", channel_id, %url, error = %err, "websocket connect failed");
                    sink.close(CloseEvent::failed(err.to_string()));
                    return;
                }
                Err(_) => {
                    debug!(target = "tether::websocket", channel_id, %url, "websocket connect timed out");
                    sink.close(CloseEvent::failed("connect timed out"));
                    return;
                }
            },
            request = outbound.recv() => match request {
                Some(Outbound::Frame(_)) => continue,
                Some(Outbound::Close) | None => {
                    sink.close(CloseEvent::local());
                    return;
                }
            },
        }
    };

    sink.open();
    let close = pump(ws_stream, &mut outbound, &sink).await;
    debug!(
        target = "tether::websocket",
        channel_id,
        kind = ?close.kind,
        code = ?close.code,
        "websocket closed"
    );
    sink.close(close);
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    sink: &SocketSink,
) -> CloseEvent {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = ws_sender.send(Message::Binary(frame.to_vec())).await {
                        return CloseEvent::error(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(err) = ws_sender.send(Message::Close(None)).await {
                        debug!(target = "tether::websocket", error = %err, "close frame not delivered");
                    }
                    return CloseEvent::local();
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Binary(data))) => sink.message(Bytes::from(data)),
                Some(Ok(Message::Text(text))) => sink.message(Bytes::from(text.into_bytes())),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => CloseEvent::remote(Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => CloseEvent::remote(None, ""),
                    };
                }
                Some(Ok(_)) => {} // Ping/Pong are answered by tungstenite
                Some(Err(err)) => {
                    warn!(target = "tether::websocket", error = %err, "websocket read failed");
                    return CloseEvent::error(err.to_string());
                }
                None => return CloseEvent::remote(None, "stream ended"),
            },
        }
    }
}
