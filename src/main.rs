use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use netplay::config::MemoryConfig;
use netplay::params::Mode;
use netplay::session::{Peer, SessionEndpoint};
use netplay::setup::NetPlaySetup;
use netplay::transport::TlsMode;
use netplay::traversal::{TraversalServer, TraversalServerConfig};
use netplay::ui::NetPlayUi;
use netplay::{SessionError, SessionFactory, SessionOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// NetPlay session negotiation: host, join, or run a traversal server
#[derive(Debug, Parser)]
#[command(name = "netplay", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the stored NetPlay settings
#[derive(Debug, Args)]
struct CommonArgs {
    /// Nickname shown to other players
    #[arg(long, global = true)]
    nickname: Option<String>,

    /// Traversal server host
    #[arg(long, global = true)]
    traversal_server: Option<String>,

    /// Traversal server port
    #[arg(long, global = true)]
    traversal_port: Option<u16>,

    /// Talk to the traversal server over TLS
    #[arg(long, global = true)]
    tls: bool,

    /// Accept self-signed traversal server certificates (development only)
    #[arg(long, global = true, requires = "tls")]
    insecure: bool,

    /// Connect timeout in seconds
    #[arg(long, global = true, default_value_t = 10)]
    connect_timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Session(SessionCommand),
    /// Run a traversal server
    TraversalServer {
        #[arg(long, default_value = "0.0.0.0:6262")]
        bind: SocketAddr,

        /// Maximum number of registered hosts
        #[arg(long, default_value_t = 4096)]
        max_hosts: usize,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Host a game
    Host {
        /// Game to host
        #[arg(long)]
        game: String,

        /// Get a host code from the traversal server instead of sharing an address
        #[arg(long)]
        traversal: bool,

        /// Direct mode port, 0 for any
        #[arg(long)]
        port: Option<u16>,

        /// Traversal mode listen port, 0 for any
        #[arg(long)]
        listen_port: Option<u16>,

        /// Forward the port on the router through UPnP
        #[arg(long)]
        upnp: bool,
    },
    /// Join a hosted game
    Join {
        /// Host address (direct mode)
        #[arg(long, conflicts_with = "code")]
        address: Option<String>,

        /// Host port (direct mode)
        #[arg(long)]
        port: Option<u16>,

        /// Host code (traversal mode)
        #[arg(long)]
        code: Option<String>,
    },
}

/// Prints session events for a terminal user
struct ConsoleUi;

impl NetPlayUi for ConsoleUi {
    fn session_established(&self, endpoint: &SessionEndpoint) {
        println!();
        println!("✅ Session established!");
        println!("  Role       : {:?}", endpoint.role());
        println!("  Local port : {}", endpoint.local_port());
        if let Some(code) = endpoint.host_code() {
            println!("  Host code  : {}", code);
        }
        if let Some(remote) = endpoint.remote_addr() {
            println!("  Host       : {}", remote);
        }
        println!("  Game       : {}", endpoint.game());
        println!();
    }

    fn session_failed(&self, error: &SessionError) {
        eprintln!("❌ {}", error);
    }

    fn players_changed(&self, players: &[Peer]) {
        println!("Players:");
        for player in players {
            println!("  {} {}", player.id, player.nickname);
        }
    }

    fn game_changed(&self, game: &str) {
        println!("🎮 Game: {}", game);
    }

    fn connection_lost(&self) {
        eprintln!("⚠️  Lost connection to the host");
    }

    fn traversal_lost(&self) {
        eprintln!("⚠️  Lost the traversal server, the host code no longer works");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Command::TraversalServer { bind, max_hosts } => {
            run_traversal_server(bind, max_hosts).await
        }
        Command::Session(command) => run_session(&cli.common, command).await,
    }
}

async fn run_traversal_server(bind: SocketAddr, max_hosts: usize) -> Result<()> {
    let config = TraversalServerConfig {
        max_hosts,
        ..Default::default()
    };
    let server = TraversalServer::bind(bind, config)
        .await
        .with_context(|| format!("Failed to bind traversal server on {}", bind))?;

    println!("Traversal server listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop.");

    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.cancel();
    });

    server.run(token).await;
    Ok(())
}

async fn run_session(common: &CommonArgs, command: SessionCommand) -> Result<()> {
    let options = SessionOptions {
        connect_timeout: Duration::from_secs(common.connect_timeout),
        traversal_tls: if common.tls {
            TlsMode::Tls {
                accept_invalid_certs: common.insecure,
            }
        } else {
            TlsMode::Plain
        },
        upnp: matches!(command, SessionCommand::Host { upnp: true, .. }),
        ..Default::default()
    };
    let factory = SessionFactory::with_options(Arc::new(ConsoleUi), options);
    let mut setup = NetPlaySetup::new(MemoryConfig::new().with_env_overrides(), factory);

    let settings = setup.settings_mut();
    if let Some(nickname) = &common.nickname {
        settings.nickname = nickname.clone();
    }
    if let Some(server) = &common.traversal_server {
        settings.traversal_server = server.clone();
    }
    if let Some(port) = common.traversal_port {
        settings.traversal_port = port.to_string();
    }

    println!("Configuration:");
    println!("  Nickname  : {}", setup.settings().nickname);
    println!("  {}", setup.traversal_label());
    println!();

    let result = match command {
        SessionCommand::Host {
            game,
            traversal,
            port,
            listen_port,
            ..
        } => {
            let settings = setup.settings_mut();
            settings.mode = if traversal { Mode::Traversal } else { Mode::Direct };
            if let Some(port) = port {
                settings.host_port = port.to_string();
            }
            if let Some(port) = listen_port {
                settings.listen_port = port.to_string();
            }
            setup.host(&game).await.map(|_| ())
        }
        SessionCommand::Join { address, port, code } => {
            let settings = setup.settings_mut();
            match code {
                Some(code) => {
                    settings.mode = Mode::Traversal;
                    settings.host_code = code;
                }
                None => {
                    settings.mode = Mode::Direct;
                    if let Some(address) = address {
                        settings.address = address;
                    }
                }
            }
            if let Some(port) = port {
                settings.connect_port = port.to_string();
            }
            setup.join().await.map(|_| ())
        }
    };

    if let Err(e) = result {
        bail!(setup.describe_failure(&e));
    }

    println!("Press Ctrl+C to leave.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    setup.shutdown().await;
    println!("👋 Session closed");
    Ok(())
}
