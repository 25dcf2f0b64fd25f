//! meshrelayd — bridges a local IRC-protocol chat client to a cjdns-style
//! mesh overlay.
//!
//! # Usage
//!
//! ```bash
//! meshrelayd                      # Start with the saved/default config
//! meshrelayd --nick alice          # Override the chat nick for this run
//! meshrelayd --my-address fc00::1  # Override the node's overlay address
//! meshrelayd --chat-port 6668       # Use a specific loopback chat port
//! ```
//!
//! On first run, the daemon creates a config file with default ports and no
//! overlay address set; the address must be supplied via `--my-address` or
//! a subsequent edit of the config file before the daemon can service peers.
//!
//! # Architecture
//!
//! The daemon spawns two concurrent tasks plus the main event loop:
//! 1. Chat TCP accept loop (one task per connected client)
//! 2. Main event loop in `Daemon` (mesh datagrams, admin replies, timers)

mod admin_client;
mod app;
mod chat_listener;
mod chat_server;
mod peer_registry;

use anyhow::{Context, Result};
use app::{ChatEvent, Daemon};
use chat_listener::ChatListener;
use clap::Parser;
use meshrelay_core::config::AppConfig;
use meshrelay_core::types::Address;
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};

/// meshrelay daemon — bridges a local IRC-protocol client to a cjdns-style
/// mesh overlay.
#[derive(Parser, Debug)]
#[command(name = "meshrelayd", about = "meshrelay mesh chat relay daemon")]
struct Cli {
    /// Chat nick for this run. Overrides the value in config.toml.
    #[arg(short, long)]
    nick: Option<String>,

    /// This node's canonical overlay address (e.g. fc00::1). Overrides the
    /// value in config.toml. Required, one way or another, before the
    /// daemon can service peers.
    #[arg(long)]
    my_address: Option<String>,

    /// Loopback TCP port the chat front end listens on.
    #[arg(long)]
    chat_port: Option<u16>,

    /// UDP port used for mesh peer datagrams.
    #[arg(long)]
    mesh_port: Option<u16>,

    /// UDP port of the local overlay admin service.
    #[arg(long)]
    admin_port: Option<u16>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    // -----------------------------------------------------------------------
    // Load or create configuration
    // -----------------------------------------------------------------------
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match AppConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("first run detected, creating new config");
            let nick = cli.nick.clone().unwrap_or_else(get_fallback_nick);
            let config = AppConfig::new_first_run(&nick);
            config.save_to(&config_path)?;
            info!(path = %config_path.display(), nick = %config.nick, "saved new config");
            config
        }
    };

    // CLI overrides
    if let Some(nick) = &cli.nick {
        config.nick = nick.clone();
    }
    if let Some(addr) = &cli.my_address {
        config.my_address = Some(addr.clone());
    }
    if let Some(port) = cli.chat_port {
        config.chat_port = port;
    }
    if let Some(port) = cli.mesh_port {
        config.mesh_port = port;
    }
    if let Some(port) = cli.admin_port {
        config.admin_port = port;
    }

    let my_address = match &config.my_address {
        Some(raw) => Address::parse(raw)
            .with_context(|| format!("configured my_address '{raw}' is not a valid overlay address"))?,
        None => {
            anyhow::bail!(
                "no overlay address configured; pass --my-address or set my_address in {}",
                config_path.display()
            );
        }
    };

    // -----------------------------------------------------------------------
    // Bind sockets
    // -----------------------------------------------------------------------
    let chat_listener = ChatListener::bind(&format!("127.0.0.1:{}", config.chat_port))
        .await
        .context("failed to start chat TCP listener")?;
    info!(port = chat_listener.local_port()?, "chat TCP listener started");

    let mesh_socket = UdpSocket::bind(format!("[::]:{}", config.mesh_port))
        .await
        .context("failed to bind mesh UDP socket")?;
    info!(port = config.mesh_port, "mesh UDP socket bound");

    let admin_socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .context("failed to bind admin UDP socket")?;
    admin_socket
        .connect(format!("127.0.0.1:{}", config.admin_port))
        .await
        .context("failed to connect admin UDP socket")?;
    info!(port = config.admin_port, "admin UDP socket connected");

    // -----------------------------------------------------------------------
    // Wire up the daemon and spawn subsystems
    // -----------------------------------------------------------------------
    let mut daemon = Daemon::new(config.nick.clone(), my_address, config.mesh_port);

    let (chat_tx, chat_rx) = mpsc::channel::<ChatEvent>(256);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        chat_listener.accept_loop(chat_tx).await;
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating shutdown");
                let _ = shutdown_tx.send(()).await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for Ctrl+C");
            }
        }
    });

    info!(nick = %config.nick, "daemon is running. Press Ctrl+C to stop.");
    daemon.run(chat_rx, mesh_socket, admin_socket, shutdown_rx).await;

    info!("daemon stopped");
    Ok(())
}

/// Falls back to the local username when no nick was supplied on first run.
fn get_fallback_nick() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "meshrelay-user".to_string())
}

/// Initializes the tracing logging infrastructure.
///
/// Sets up a layered subscriber that writes to stderr and, best-effort, to
/// a log file in the data directory. Log level is controlled by the
/// `MESHRELAY_LOG` environment variable, defaulting to `info`.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env("MESHRELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = AppConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("meshrelay.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
