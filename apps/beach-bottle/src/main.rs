use std::path::PathBuf;
use std::sync::Arc;

use beach_bottle::config::Config;
use beach_bottle::message_log::{Message, MessageLog, Sender};
use beach_bottle::registry::SessionRegistry;
use beach_bottle::session::{PeerIdentity, SessionContext, SessionError, SessionEvent};
use beach_bottle::signal::{SignalEnvelope, SignalError, signal_path};
use beach_bottle::storage::{
    FsStorage, HttpStorage, PeerAddress, StorageClient, StorageError, read_json,
};
use beach_bottle::telemetry::{self, LogLevel, LogOptions};
use beach_bottle::transport::webrtc::WebRtcTransportFactory;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_options = cli.logging.options();
    telemetry::init(&log_options)?;
    debug!(log_level = ?log_options.level, log_file = ?log_options.file, "logging configured");

    let mut config = Config::from_env();
    if let Some(address) = cli.address {
        config.address = Some(address);
    }
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    if let Some(hub) = cli.hub {
        config.hub_url = Some(hub);
    }

    match cli.command {
        Command::Chat(args) => handle_chat(&config, args).await,
        Command::History(args) => handle_history(&config, args).await,
        Command::Signal(args) => handle_signal(&config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "beach-bottle",
    about = "🍾 Peer-to-peer chat rendezvousing through shared storage",
    author,
    version
)]
struct Cli {
    #[arg(long, global = true, help = "Address this node publishes under (BOTTLE_ADDRESS)")]
    address: Option<String>,

    #[arg(
        long = "storage-root",
        global = true,
        value_name = "DIR",
        help = "Directory holding the shared storage medium (BOTTLE_STORAGE_ROOT)"
    )]
    storage_root: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Use an HTTP storage hub instead of a local directory (BOTTLE_HUB_URL)"
    )]
    hub: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "BOTTLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "BOTTLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn options(&self) -> LogOptions {
        LogOptions {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with a peer; each stdin line is sent as a message
    Chat(ChatArgs),
    /// Print the stored conversation with a peer
    History(PeerArgs),
    /// Inspect the signal a peer currently publishes
    Signal(PeerArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, help = "Address of the remote peer")]
    peer: String,

    #[arg(long, help = "Display name announced to the peer")]
    name: Option<String>,
}

#[derive(Args, Debug)]
struct PeerArgs {
    #[arg(long, help = "Address of the remote peer")]
    peer: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("message log error: {0}")]
    Log(#[from] beach_bottle::message_log::LogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no local address; pass --address or set BOTTLE_ADDRESS")]
    MissingAddress,
    #[error("invalid hub url '{url}': {source}")]
    InvalidHub {
        url: String,
        source: url::ParseError,
    },
    #[error("logging initialization failed: {0}")]
    Logging(#[from] telemetry::InitError),
}

fn local_address(config: &Config) -> Result<PeerAddress, CliError> {
    let raw = config.address.as_deref().ok_or(CliError::MissingAddress)?;
    Ok(PeerAddress::new(raw)?)
}

fn open_storage(config: &Config) -> Result<Arc<dyn StorageClient>, CliError> {
    let address = local_address(config)?;
    match &config.hub_url {
        Some(hub) => {
            let url = Url::parse(hub).map_err(|source| CliError::InvalidHub {
                url: hub.clone(),
                source,
            })?;
            let mut storage = HttpStorage::new(url.as_str(), address)?;
            if let Some(token) = &config.hub_token {
                storage = storage.with_token(token.clone());
            }
            info!(hub = %url, "using http storage hub");
            Ok(Arc::new(storage))
        }
        None => {
            info!(root = %config.storage_root.display(), "using local storage medium");
            Ok(Arc::new(FsStorage::new(config.storage_root.clone(), address)))
        }
    }
}

async fn handle_chat(config: &Config, args: ChatArgs) -> Result<(), CliError> {
    let storage = open_storage(config)?;
    let local = storage.self_address().clone();
    let peer = PeerAddress::new(args.peer)?;
    let username = args
        .name
        .unwrap_or_else(|| format!("guest-{}", &Uuid::new_v4().simple().to_string()[..8]));

    let transports = Arc::new(WebRtcTransportFactory::new(config.webrtc()));
    let mut context = SessionContext::new(storage, transports).with_identity(PeerIdentity {
        username,
        profile: json!({ "address": local.as_str() }),
    });
    context.codec = config.codec();
    context.retry_interval = config.retry_interval();
    context.block_size = config.block_size;

    let (mut registry, mut events) = SessionRegistry::new(context);
    registry.establish(peer.clone()).await?;
    println!("🍾 {local} waiting for {peer} (type /quit to leave)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                let Some(session) = registry.get(&peer) else { break };
                if let Err(err) = session.send_message(Value::String(text.to_string())).await {
                    eprintln!("⚠️  {err}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    registry.end_all().await;
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionStatusChanged { peer, connected } => {
            if *connected {
                println!("🟢 connected to {peer}");
            } else {
                println!("🔴 lost connection to {peer}, retrying");
            }
        }
        SessionEvent::PeerIdentified { peer, identity } => {
            println!("👋 {peer} is {}", identity.username);
        }
        SessionEvent::SessionReady { history, .. } => {
            for message in history {
                print_message(message);
            }
        }
        SessionEvent::MessageReceived { message, .. } | SessionEvent::MessageSent { message, .. } => {
            print_message(message);
        }
        SessionEvent::Error { peer, message } => eprintln!("⚠️  {peer}: {message}"),
    }
}

fn print_message(message: &Message) {
    let who = match message.sender {
        Sender::Local => "me",
        Sender::Remote => "them",
    };
    let body = match &message.body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let at = message.sent_at.time();
    println!("[{:02}:{:02}] {who}: {body}", at.hour(), at.minute());
}

async fn handle_history(config: &Config, args: PeerArgs) -> Result<(), CliError> {
    let storage = open_storage(config)?;
    let peer = PeerAddress::new(args.peer)?;
    let Some(log) = MessageLog::open_existing(storage, &peer, config.block_size).await? else {
        println!("no messages with {peer}");
        return Ok(());
    };
    let history = log.replay_all().await?;
    if history.is_empty() {
        println!("no messages with {peer}");
    }
    for message in &history {
        print_message(message);
    }
    Ok(())
}

async fn handle_signal(config: &Config, args: PeerArgs) -> Result<(), CliError> {
    let storage = open_storage(config)?;
    let peer = PeerAddress::new(args.peer)?;
    let path = signal_path(&peer);
    let envelope = match read_json::<SignalEnvelope>(storage.as_ref(), &path).await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            println!("{peer} has not published a signal");
            return Ok(());
        }
        Err(StorageError::Decode { .. }) => {
            println!("{peer} published an unreadable signal document");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    match config.codec().decode(&envelope) {
        Ok(signal) => {
            let kind = signal.get("type").and_then(Value::as_str).unwrap_or("unknown");
            println!(
                "{peer} offers a {kind} signal as {} (expires at {})",
                envelope.role, envelope.expires_at
            );
        }
        Err(SignalError::Expired { expires_at }) => {
            println!("{peer} signal expired at {expires_at}");
        }
        Err(err) => println!("{peer} signal is invalid: {err}"),
    }
    Ok(())
}
