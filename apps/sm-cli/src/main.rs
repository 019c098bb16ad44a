use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sm_client::{Client, ClientConfig, ClientEvent, ClientHandle, Engine};
use sm_crypto::RelayPublicKey;
use sm_store::{namespace_for_host, paths::default_pin_file, FilePinStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sm-cli")]
#[command(about = "SprintMate terminal client", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, env = "SM_CONFIG")]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (ws:// or wss://)
    #[arg(long)]
    relay: Option<String>,

    /// Bootstrap relay public key (base64 Ed25519)
    #[arg(long)]
    relay_key: Option<String>,

    /// Pin file (defaults to the user data directory)
    #[arg(long)]
    pin_file: Option<PathBuf>,

    /// Refuse a relay key that differs from the pin
    #[arg(long)]
    no_key_rotation: bool,

    /// Use the legacy XOR pairwise key derivation
    #[arg(long)]
    legacy_xor_kdf: bool,

    /// Verbose protocol logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and chat over stdin/stdout
    Chat {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        room: String,

        /// Room password
        #[arg(short, long, env = "SM_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show the pinned relay key for the configured relay
    ShowPin,

    /// Forget the pinned relay key for the configured relay
    ForgetPin,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => ClientConfig::default(),
        };
        config.apply_env();
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(key) = &self.relay_key {
            config.relay_public_key = Some(key.clone());
        }
        if let Some(path) = &self.pin_file {
            config.pin_file = Some(path.clone());
        }
        if self.no_key_rotation {
            config.allow_server_key_rotation = false;
        }
        if self.legacy_xor_kdf {
            config.legacy_xor_kdf = true;
        }
        if self.debug {
            config.debug = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "sm_cli=debug,sm_client=debug,sm_store=debug,sm_crypto=debug"
    } else {
        "sm_cli=info,sm_client=info,sm_store=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.client_config()?;
    init_tracing(config.debug);

    match cli.command {
        Commands::Chat {
            username,
            room,
            password,
            json,
        } => chat(config, &username, &room, &password, json).await,
        Commands::ShowPin => show_pin(&config),
        Commands::ForgetPin => {
            let mut anchor = config.trust_anchor();
            anchor.clear();
            println!("Forgot relay key for {}", anchor.namespace());
            Ok(())
        }
    }
}

fn show_pin(config: &ClientConfig) -> Result<()> {
    let path = match &config.pin_file {
        Some(path) => path.clone(),
        None => default_pin_file()?,
    };
    let namespace = namespace_for_host(config.relay_host().as_deref());
    match FilePinStore::new(&path).record(&namespace)? {
        Some(record) => {
            let fingerprint = RelayPublicKey::from_b64(&record.key)
                .map(|k| k.fingerprint())
                .unwrap_or_else(|_| "<unparseable>".into());
            println!("{namespace}");
            println!("  key:         {}", record.key);
            println!("  fingerprint: {fingerprint}");
            println!("  pinned at:   {}", record.pinned_at.to_rfc3339());
        }
        None => println!("No relay key pinned for {namespace} in {}", path.display()),
    }
    Ok(())
}

async fn chat(config: ClientConfig, username: &str, room: &str, password: &str, json: bool) -> Result<()> {
    let engine = Engine::new(config)?;
    let (handle, mut events, task) = Client::spawn(engine);
    handle.set_credentials(username, room, password).await?;
    handle.connect().await?;
    info!(op = "chat", "connecting; type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let fatal = matches!(event, ClientEvent::TrustRejected { .. });
                    print_event(&event, json)?;
                    if fatal {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_line(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    handle.teardown().await?;
    let _ = task.await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_line(handle: &ClientHandle, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    match command {
        "/quit" => return Ok(false),
        "/help" => {
            println!("/nick NAME   change username");
            println!("/peers       list secured peers");
            println!("/quit        leave");
        }
        "/nick" => match handle.update_username(rest).await {
            Ok(n) => println!("* username changed, {n} peer(s) notified"),
            Err(err) => warn!(op = "nick", error = %err, "username not changed"),
        },
        "/peers" => {
            let peers = handle.peers().await?;
            if peers.is_empty() {
                println!("* no peers");
            }
            for peer in peers {
                println!("* {} ({})", peer.username, peer.peer_id);
            }
        }
        other if other.starts_with('/') => println!("* unknown command {other}, try /help"),
        _ => match handle.send_channel_message("text", line).await {
            Ok(0) => println!("* nobody here yet"),
            Ok(_) => {}
            Err(err) => warn!(op = "send", error = %err, "message not sent"),
        },
    }
    Ok(true)
}

fn print_event(event: &ClientEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    for line in render_event(event) {
        println!("{line}");
    }
    Ok(())
}

fn render_event(event: &ClientEvent) -> Vec<String> {
    match event {
        ClientEvent::ServerSecured => vec!["* connected to relay".into()],
        ClientEvent::ServerClosed(info) => {
            vec![format!("* relay connection closed ({})", info.reason)]
        }
        ClientEvent::ServerKeyRotated { previous, current } => vec![match previous {
            Some(previous) => format!("! relay key changed: {previous} -> {current}"),
            None => format!("! stored relay pin was unreadable; now pinned to {current}"),
        }],
        ClientEvent::TrustRejected { pinned, presented } => vec![
            match pinned {
                Some(pinned) => format!(
                    "! relay key {presented} does not match pinned {pinned}; refusing to connect"
                ),
                None => format!("! stored relay pin is unreadable; refusing relay key {presented}"),
            },
            "! run `sm-cli forget-pin` only if you trust the new key".into(),
        ],
        ClientEvent::PeerSecured { username, .. } => vec![format!("* {username} is here")],
        ClientEvent::PeerList { peers } => vec![format!("* {} peer(s) in room", peers.len())],
        ClientEvent::Message(msg) => vec![match &msg.data {
            sm_client::ChannelData::Text(text) => format!("<{}> {text}", msg.username),
            sm_client::ChannelData::Structured(map) => format!(
                "<{}> [{}] {}",
                msg.username,
                msg.kind,
                serde_json::Value::Object(map.clone())
            ),
        }],
    }
}
