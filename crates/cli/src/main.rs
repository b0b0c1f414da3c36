use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use chatsync::client::ServerClient;
use chatsync::store::QueryKey;
use chatsync::sync::SyncSession;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "chatsync")]
#[command(about = "chatsync CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: CHATSYNC_CONFIG_PATH or ~/.chatsync/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Fetch and print the server's session list.
    Sessions {
        /// Config file path (default: CHATSYNC_CONFIG_PATH or ~/.chatsync/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Server base URL (default: CHATSYNC_SERVER_URL or server.url from config)
        #[arg(long, short, value_name = "URL")]
        server: Option<String>,
    },

    /// Follow the server's event stream and print cache and status changes until Ctrl+C.
    Watch {
        /// Config file path (default: CHATSYNC_CONFIG_PATH or ~/.chatsync/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Server base URL (default: CHATSYNC_SERVER_URL or server.url from config)
        #[arg(long, short, value_name = "URL")]
        server: Option<String>,

        /// Also seed and follow this session's messages.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatsync {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Sessions { config, server }) => {
            if let Err(e) = run_sessions(config, server).await {
                log::error!("sessions failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch {
            config,
            server,
            session,
        }) => {
            if let Err(e) = run_watch(config, server, session).await {
                log::error!("watch failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(chatsync::config::default_config_path);
    let dir = chatsync::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn server_client(
    config_path: Option<std::path::PathBuf>,
    server: Option<String>,
) -> anyhow::Result<(chatsync::config::Config, ServerClient)> {
    let (config, _) = chatsync::config::load_config(config_path)?;
    let base_url = server.unwrap_or_else(|| chatsync::config::resolve_server_url(&config));
    let client = ServerClient::from_config(&base_url, &config.server)?;
    Ok((config, client))
}

async fn run_sessions(
    config_path: Option<std::path::PathBuf>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let (_, client) = server_client(config_path, server)?;
    let sessions = client.list_sessions().await?;
    if sessions.is_empty() {
        println!("no sessions on {}", client.base_url());
    }
    for s in sessions {
        let updated = s
            .updated_at()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{}  {}  {}", s.id, updated, s.title);
    }
    Ok(())
}

async fn run_watch(
    config_path: Option<std::path::PathBuf>,
    server: Option<String>,
    session_id: Option<String>,
) -> anyhow::Result<()> {
    let (config, client) = server_client(config_path, server)?;

    let mut sync = SyncSession::new(client.event_endpoint(), &config.sync);
    let mut cache_changes = sync.cache().subscribe();
    let mut status_changes = sync.status().subscribe();
    let mut connection = sync.connection();

    let n = client.seed_sessions(sync.cache()).await?;
    println!("{} session(s) on {}", n, client.base_url());
    if let Some(id) = &session_id {
        let n = client.seed_messages(sync.cache(), id).await?;
        println!("{} message(s) in session {}", n, id);
    }
    sync.wake();

    let mut reconnect_at: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = cache_changes.recv() => match change {
                Ok(key) => print_cache_change(&sync, &key).await,
                Err(RecvError::Lagged(n)) => log::debug!("missed {} cache notifications", n),
                Err(RecvError::Closed) => break,
            },
            change = status_changes.recv() => match change {
                Ok(c) => println!("session {} is {}", c.session_id, c.status),
                Err(RecvError::Lagged(n)) => log::debug!("missed {} status notifications", n),
                Err(RecvError::Closed) => break,
            },
            res = connection.changed() => {
                if res.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                if state.connected {
                    println!("connected to {}", sync.endpoint());
                } else if let Some(err) = state.error {
                    println!("disconnected: {}", err);
                    reconnect_at = Some(tokio::time::Instant::now() + RECONNECT_DELAY);
                }
            }
            _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(tokio::time::Instant::now)), if reconnect_at.is_some() => {
                reconnect_at = None;
                sync.reconnect().await;
            }
        }
    }

    sync.shutdown().await;
    Ok(())
}

async fn print_cache_change(sync: &SyncSession, key: &QueryKey) {
    match key {
        QueryKey::Sessions => {
            let n = sync.cache().sessions().await.map_or(0, |s| s.len());
            println!("sessions: {}", n);
        }
        QueryKey::SessionMessages(id) => {
            let Some(messages) = sync.cache().messages(id).await else {
                return;
            };
            let parts: usize = messages.iter().map(|m| m.parts.len()).sum();
            println!("session {}: {} message(s), {} part(s)", id, messages.len(), parts);
            if let Some(last) = messages.last() {
                let at = last
                    .info
                    .created_at()
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                let text = last.parts.iter().rev().find_map(|p| p.text()).unwrap_or("");
                println!("  [{}] {:?}: {}", at, last.info.role, text);
            }
        }
    }
}
