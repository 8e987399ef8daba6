//! Voting cluster node
//!
//! Wires one coordination core to its HTTP boundary: environment + CLI
//! configuration, tracing bootstrap, shared-store connection with the
//! startup retry schedule, background task set, axum server with graceful
//! shutdown. Startup failures (unreachable store, bind error) exit non-zero
//! so the orchestrator restarts the node.

mod http;

use ballot_core::config::NodeConfig;
use ballot_core::node::Node;
use ballot_core::store::{MemoryStore, RedisStore, SharedStore};
use ballot_core::types::Role;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const STORE_CONNECT_ATTEMPTS: u32 = 10;

/// Replicated voting cluster node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier (overrides NODE_ID)
    #[arg(long)]
    node_id: Option<String>,

    /// Initial role hint, leader or follower (overrides NODE_ROLE)
    #[arg(long)]
    role: Option<String>,

    /// Comma-separated shared-store endpoints (overrides SHARED_STORE_NODES)
    #[arg(long)]
    store_nodes: Option<String>,

    /// Directory for log output (overrides LOG_DIR)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// HTTP listen port
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Use an in-process store instead of a shared backend (development)
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = NodeConfig::from_env()?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(role) = args.role {
        config.initial_role = role
            .parse::<Role>()
            .map_err(|_| format!("invalid role '{}'", role))?;
    }
    if let Some(nodes) = args.store_nodes {
        config.store_nodes = ballot_core::config::parse_endpoints(&nodes)?;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = Some(dir);
    }
    config.http_port = args.port;

    init_logging(&config)?;
    info!(
        "Node {} starting with role hint {}",
        config.node_id, config.initial_role
    );

    let store: Arc<dyn SharedStore> = if args.memory_store {
        info!("Using in-process memory store");
        Arc::new(MemoryStore::new())
    } else {
        let store =
            RedisStore::connect_with_retry(&config.store_nodes, STORE_CONNECT_ATTEMPTS).await?;
        info!("Connected to shared store at {}", store.endpoint());
        Arc::new(store)
    };

    let node = Node::new(config.clone(), store);
    let handles = node.start().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP listening on {}", addr);

    let app = http::router(node.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    node.shutdown().await;
    // Loops observe the shutdown watch; give them a moment, then reap.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    for handle in handles {
        handle.abort();
    }
    info!("Node {} stopped", config.node_id);
    Ok(())
}

fn init_logging(config: &NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::File::create(dir.join(format!("{}.log", config.node_id)))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
