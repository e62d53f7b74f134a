use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use murmur::admin::{self, AdminCommand};
use murmur::persist;
use murmur::server::DEFAULT_PORT;
use murmur::{NodeId, Peer, RoutingTable, Server, DEFAULT_K};

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about = "Kademlia-style DHT peer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a peer in the foreground until stopped.
    Start {
        /// Routing-table file to load on start and save on shutdown.
        #[arg(long)]
        file: Option<PathBuf>,

        /// UDP port to listen on.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Ask the running peer to shut down.
    Stop,
    /// Inspect or modify the running peer's routing table.
    #[command(subcommand)]
    Node(NodeCommand),
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Print the local peer string.
    #[command(name = "self")]
    SelfInfo,
    /// Add a peer by its base64 peer string.
    Add { peer: String },
    /// List one bucket's peers, oldest first.
    List { index: usize },
    /// Probe a peer by its base64 peer string.
    Probe { peer: String },
    /// Bump a known peer's freshness by its hex identifier.
    Update { id: String },
}

impl NodeCommand {
    fn into_admin(self) -> AdminCommand {
        match self {
            NodeCommand::SelfInfo => AdminCommand::SelfInfo,
            NodeCommand::Add { peer } => AdminCommand::AddPeer { peer },
            NodeCommand::List { index } => AdminCommand::ListBucket { index },
            NodeCommand::Probe { peer } => AdminCommand::Probe { peer },
            NodeCommand::Update { id } => AdminCommand::UpdateFreshness { id },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Start { file, port } => serve(file, port).await,
        Command::Stop => client(AdminCommand::Stop).await,
        Command::Node(node) => client(node.into_admin()).await,
    }
}

/// One-shot admin client: send the command, print whatever comes back.
async fn client(command: AdminCommand) -> Result<()> {
    let reply = admin::request(Path::new(admin::SOCKET_PATH), &command).await?;
    let trimmed = reply.trim_end();
    if !trimmed.is_empty() {
        println!("{trimmed}");
    }
    Ok(())
}

async fn serve(file: Option<PathBuf>, port: u16) -> Result<()> {
    let routing = match &file {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "loading routing table");
            RoutingTable::from_snapshot(persist::load(path).await?, DEFAULT_K)?
        }
        _ => {
            info!("creating an empty routing table");
            let id = NodeId::random().context("generating a node id")?;
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            RoutingTable::new(Peer::new(id, addr), DEFAULT_K)
        }
    };

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let server = Server::bind(bind, routing).await?;
    server.start();

    let me = server.self_peer();
    info!(id = %me.id, addr = %server.local_addr()?, "peer is up");
    if let Ok(text) = me.to_base64() {
        info!(peer_string = %text, "hand this string to peers that should add us");
    }

    // A previous run that crashed leaves its socket file behind.
    let _ = std::fs::remove_file(admin::SOCKET_PATH);
    let listener = UnixListener::bind(admin::SOCKET_PATH)
        .with_context(|| format!("binding admin socket at {}", admin::SOCKET_PATH))?;
    let (stop_tx, mut stop_rx) = watch::channel(false);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(admin::handle(stream, server.clone(), stop_tx.clone()));
                }
                Err(err) => warn!(%err, "admin accept failed"),
            },
        }
    }

    server.stop();
    if let Some(path) = &file {
        persist::save(path, &server.routing().snapshot().await).await?;
        info!(path = %path.display(), "routing table saved");
    }
    let _ = std::fs::remove_file(admin::SOCKET_PATH);
    Ok(())
}
