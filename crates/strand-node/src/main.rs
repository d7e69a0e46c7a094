//! # strand-node
//!
//! A strand peer. It keeps encrypted threads in sync with the other members,
//! stores messages for peers that are offline (and fetches the ones left for
//! it), and backs its threads up to cafes.
//!
//! This binary provides:
//! - **Peer service** over TCP for thread blocks, content and cafe requests
//! - **Kademlia DHT** (libp2p over QUIC) for pointers and peer addresses
//! - **Background loops** for cafe flushing, message retrieval and pointer
//!   republishing
//! - **Cafe hosting** when `STRAND_CAFE_HOST=true`

mod repo;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::{Node, NodeCollaborators, NodeConfig};
use strand_net::{spawn_swarm, KadRouting, SwarmConfig, SwarmNotification, TcpDialer};
use strand_store::{Database, FsContentStore};

use crate::repo::Repo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strand_node=debug,strand_core=debug")),
        )
        .init();

    info!("Starting strand node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the repository
    // -----------------------------------------------------------------------
    let repo = Repo::open(&config.repo_path)?;
    let identity = Arc::new(repo.load_or_create_identity()?);
    info!(peer = %identity.peer_id(), repo = %config.repo_path.display(), "Node identity loaded");

    let db = Arc::new(Database::open_at(&repo.database_path())?);
    let content = Arc::new(FsContentStore::new(repo.blocks_path()).await?);

    // -----------------------------------------------------------------------
    // 4. Spawn the DHT swarm (runs in background tokio task)
    // -----------------------------------------------------------------------
    let (commands, mut notifications, swarm_peer) = spawn_swarm(
        &identity,
        SwarmConfig {
            bootstrap_peers_path: config.bootstrap_peers_path.clone(),
            listen_port: config.dht_port,
            extra_dials: Vec::new(),
        },
    )
    .await?;
    info!(swarm_peer = %swarm_peer, port = config.dht_port, "DHT swarm running in background");

    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                SwarmNotification::PeerConnected { peer_id, address } => {
                    debug!(peer = %peer_id, addr = %address, "DHT peer connected")
                }
                SwarmNotification::PeerDisconnected { peer_id } => {
                    debug!(peer = %peer_id, "DHT peer disconnected")
                }
            }
        }
    });

    let routing = Arc::new(KadRouting::new(commands));
    let dialer = Arc::new(TcpDialer::new().with_resolver(routing.clone()));
    for (peer, addr) in &config.peers {
        dialer.add_address(*peer, addr.clone());
    }

    // -----------------------------------------------------------------------
    // 5. Build the node and start its background loops
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(config.listen_addr).await?;
    let node = Node::build(
        config.clone(),
        NodeCollaborators {
            identity,
            db,
            content,
            routing: routing.clone(),
            dialer,
        },
    )?;
    node.start(Some(listener));
    info!(threads = node.threads().list().len(), "Node ready");

    match config.advertised_addr() {
        Some(addr) => {
            if let Err(e) = routing.publish_address(node.peer_id(), addr.clone()).await {
                warn!(addr = %addr, error = %e, "Failed to publish service address");
            }
        }
        None => warn!("No dialable service address; set STRAND_PUBLIC_ADDR so peers can reach us"),
    }

    // -----------------------------------------------------------------------
    // 6. Register with the configured cafes
    // -----------------------------------------------------------------------
    if !config.cafes.is_empty() {
        let registered = node.register_configured_cafes().await;
        info!(registered, configured = config.cafes.len(), "Cafe registration done");
    }

    // -----------------------------------------------------------------------
    // 7. Run until shutdown
    // -----------------------------------------------------------------------
    let mut updates = node.updates().subscribe();
    loop {
        tokio::select! {
            Some(update) = updates.recv() => {
                debug!(
                    thread = %update.thread_id.short(),
                    block = %update.block_id.short(),
                    block_type = %update.block_type,
                    author = %update.author.short(),
                    "Thread updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    routing.shutdown().await;
    Ok(())
}
