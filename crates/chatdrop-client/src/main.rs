//! Chatdrop - chat and file drop over a single peer data channel
//!
//! The `send` command runs both peers in-process over a loopback channel:
//! it performs the offer/answer handshake, sends a message and a file, and
//! writes what the receiving side reassembled into the download directory.

use anyhow::Result;
use chatdrop_client::config::{expand_path, Config};
use chatdrop_client::{ChatEvent, ChatLog};
use chatdrop_core::channel::memory::{MemoryChannel, MemoryEndpoint};
use chatdrop_core::{Artifact, ChannelEvent, DataChannel, Subscription, TransferId};
use clap::{Parser, Subcommand};
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chatdrop")]
#[command(about = "Chat and file drop over a peer data channel", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.chatdrop/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to an in-process peer over a loopback channel
    Send {
        /// Path to the file to send
        #[arg(required = true)]
        file: String,

        /// Chat message sent before the file
        #[arg(short, long, default_value = "incoming file")]
        message: String,

        /// Directory the receiving peer writes into (overrides config)
        #[arg(short, long)]
        out: Option<String>,

        /// Chunk size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Print the receiver's transfer views as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show configuration and protocol details
    Status,

    /// Initialize configuration
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Config::load_or_default(&expand_path(&cli.config))?;

    match cli.command {
        Commands::Send {
            file,
            message,
            out,
            chunk_size,
            json,
        } => {
            send_file(&config, &file, &message, out.as_deref(), chunk_size, json).await?;
        }
        Commands::Status => {
            show_status(&config);
        }
        Commands::Init => {
            init_config()?;
        }
    }

    Ok(())
}

/// One in-process peer: its log plus the two event streams it consumes
struct Peer {
    name: String,
    log: ChatLog<MemoryChannel>,
    channel_events: UnboundedReceiver<ChannelEvent>,
    chat_events: Subscription<ChatEvent>,
    completed: Vec<(TransferId, Artifact)>,
}

impl Peer {
    fn new(endpoint: MemoryEndpoint, nick: &str, peer: &str, chunk_size: usize) -> Result<Self> {
        let MemoryEndpoint { channel, events } = endpoint;
        let mut log = ChatLog::builder()
            .channel(channel)
            .peer(peer.parse()?)
            .local_user(nick)
            .chunk_size(chunk_size)
            .build()?;
        let chat_events = log.subscribe();

        Ok(Self {
            name: nick.to_string(),
            log,
            channel_events: events,
            chat_events,
            completed: Vec::new(),
        })
    }

    /// Feed every queued channel event into the log
    async fn pump_channel(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(event) = self.channel_events.try_recv() {
            progressed = true;
            if let Err(e) = self.log.handle_event(event).await {
                tracing::warn!("{}: {}", self.name, e);
            }
        }
        progressed
    }

    /// React to our own chat events; signaling is relayed to `other`
    async fn pump_chat(&mut self, other: &mut Peer) -> Result<bool> {
        let events = self.chat_events.drain();
        let progressed = !events.is_empty();

        for event in events {
            match event {
                ChatEvent::SendOffer { offer, protocol, .. } => {
                    tracing::debug!("{} -> {}: {} offer", self.name, other.name, protocol);
                    other.log.answer(offer).await?;
                }
                ChatEvent::SendAnswer { answer, protocol, .. } => {
                    tracing::debug!("{} -> {}: {} answer", self.name, other.name, protocol);
                    other.log.establish(answer).await?;
                }
                ChatEvent::EntryAdded(id) => {
                    let text = self.log.get(id).and_then(|e| e.entry.as_text());
                    if let Some(text) = text {
                        if text.nick != self.log.local_user() {
                            println!("[{}] <{}> {}", self.name, text.nick, text.message);
                        }
                    }
                }
                ChatEvent::TransferProgress { id, progress, .. } => {
                    if let Some(transfer) = self.log.find_transfer(&id) {
                        println!("[{}] {}: {}%", self.name, transfer.filename(), progress);
                    }
                }
                ChatEvent::TransferComplete { id, artifact } => {
                    self.completed.push((id, artifact));
                }
                ChatEvent::Cleared => {
                    println!("[{}] channel closed", self.name);
                }
            }
        }

        Ok(progressed)
    }
}

/// Run both peers until neither has anything left to process
async fn settle(alice: &mut Peer, bob: &mut Peer) -> Result<()> {
    loop {
        let mut progressed = alice.pump_channel().await;
        progressed |= bob.pump_channel().await;
        progressed |= alice.pump_chat(bob).await?;
        progressed |= bob.pump_chat(alice).await?;
        if !progressed {
            return Ok(());
        }
    }
}

async fn send_file(
    config: &Config,
    file: &str,
    message: &str,
    out: Option<&str>,
    chunk_size: Option<usize>,
    json: bool,
) -> Result<()> {
    let path = Path::new(file);
    if !path.is_file() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let chunk_size = chunk_size.unwrap_or(config.transfer.chunk_size);
    let out_dir = out.map(expand_path).unwrap_or_else(|| config.download_dir());

    let (a, b) = MemoryChannel::pair(&config.nick, &config.peer);
    let mut alice = Peer::new(a, &config.nick, &config.peer, chunk_size)?;
    let mut bob = Peer::new(b, &config.peer, &config.nick, chunk_size)?;

    // The channel is still new, so this is deferred and starts the handshake
    alice.log.send_text(message).await?;
    settle(&mut alice, &mut bob).await?;

    tracing::info!("Sending {} in {} byte chunks", path.display(), chunk_size);
    let entry = alice.log.send_file(path).await?;
    settle(&mut alice, &mut bob).await?;

    let sent = alice
        .log
        .get(entry)
        .and_then(|e| e.entry.as_transfer())
        .and_then(|t| t.artifact().cloned().map(|a| (t.filename().to_string(), a)))
        .ok_or_else(|| anyhow::anyhow!("Transfer did not complete on the sending side"))?;

    let (id, received) = bob
        .completed
        .pop()
        .ok_or_else(|| anyhow::anyhow!("Transfer did not complete on the receiving side"))?;
    let filename = bob
        .log
        .find_transfer(&id)
        .map(|t| t.filename().to_string())
        .unwrap_or_else(|| sent.0.clone());

    let sent_hash = sent.1.content_hash().await?;
    let received_hash = received.content_hash().await?;
    if sent_hash != received_hash {
        anyhow::bail!(
            "Hash mismatch: sent {}, received {}",
            sent_hash,
            received_hash
        );
    }

    let written = received.write_to(&out_dir, &filename).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bob.log.views())?);
    }

    println!("Transfer: {}", id);
    println!("Size: {} bytes", received.size().await?);
    println!("Hash: {}", received_hash);
    println!("Saved: {}", written.display());

    alice.log.channel_mut().close().await?;
    settle(&mut alice, &mut bob).await?;

    Ok(())
}

fn show_status(config: &Config) {
    println!("Chatdrop v{}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", chatdrop_core::PROTOCOL_VERSION);
    println!("Nick: {}", config.nick);
    println!("Peer: {}", config.peer);
    println!("Chunk size: {} bytes", config.transfer.chunk_size);
    println!("Downloads: {}", config.download_dir().display());
}

fn init_config() -> Result<()> {
    let config_dir = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
        .join(".chatdrop");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        tracing::info!("Created config directory: {}", config_dir.display());
    }

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    let config = Config::default();
    let toml = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, toml)?;

    std::fs::create_dir_all(config.download_dir())?;

    println!("Initialized chatdrop at: {}", config_dir.display());

    Ok(())
}
