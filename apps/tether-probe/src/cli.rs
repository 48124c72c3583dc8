use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tether::journal::{decode_update, JournalDocument, JournalProtocol};
use tether::{
    ConnectionManager, Document, DocumentEvent, SessionConfig, WebSocketConfigBuilder, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tether-probe")]
#[command(about = "Journal session client and relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a journal: stdin lines are appended, remote entries are printed
    Connect(ConnectArgs),
    /// Serve a shared in-memory journal over WebSocket
    Relay(RelayArgs),
}

/// Session tuning shared by both modes.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// TOML file with session settings; TETHER_* variables override it
    #[arg(long, env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Topic prefix written on every frame
    #[arg(long)]
    pub prefix: Option<u64>,

    /// Periodic resync interval in milliseconds
    #[arg(long)]
    pub resync_interval_ms: Option<u64>,
}

impl SessionArgs {
    pub fn load(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                SessionConfig::from_toml_str(&source)
                    .with_context(|| format!("invalid session config in {}", path.display()))?
            }
            None => SessionConfig::default(),
        }
        .with_env_overrides()
        .context("invalid TETHER_* environment override")?;

        if let Some(prefix) = self.prefix {
            config = config.with_prefix(prefix);
        }
        if let Some(ms) = self.resync_interval_ms {
            config = config.with_resync_interval(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Relay URL (e.g., ws://localhost:8090)
    #[arg(short, long, env = "TETHER_URL", default_value = "ws://localhost:8090")]
    pub url: String,

    /// Path appended to the URL
    #[arg(short, long, default_value = "/ws")]
    pub path: String,

    /// Seconds before a dial attempt counts as failed
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Address to listen on
    #[arg(short, long, env = "TETHER_BIND", default_value = "0.0.0.0:8090")]
    pub bind: SocketAddr,

    #[command(flatten)]
    pub session: SessionArgs,
}

pub async fn run_connect(args: ConnectArgs) -> Result<()> {
    let config = args.session.load()?;
    let endpoint = WebSocketConfigBuilder::new()
        .url(args.url)
        .path(args.path)
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .build()
        .context("invalid relay endpoint")?;
    info!(url = %endpoint.build_url(), "joining journal");

    let doc = Arc::new(JournalDocument::new());
    let printer = tokio::spawn(print_entries(doc.subscribe()));
    let manager = ConnectionManager::builder(Arc::clone(&doc), JournalProtocol, WebSocketConnector::new(endpoint))
        .config(config)
        .build();
    manager.on_status(|event| info!(status = %event.status, "session status"));
    manager.on_synced(|_| info!("journal synced"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    doc.append(line);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(entries = doc.len(), "leaving journal");
    manager.destroy();
    printer.abort();
    Ok(())
}

async fn print_entries(mut events: broadcast::Receiver<DocumentEvent>) {
    loop {
        match events.recv().await {
            Ok(DocumentEvent::Update { update, .. }) => match decode_update(&update) {
                Ok((index, entry)) => println!("[{index}] {}", String::from_utf8_lossy(&entry)),
                Err(err) => warn!(error = %err, "undecodable journal update"),
            },
            Ok(DocumentEvent::Destroyed) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "printer fell behind");
            }
        }
    }
}
