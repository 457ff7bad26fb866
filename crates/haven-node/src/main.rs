//! Haven node entry point.

use clap::Parser;
use haven_node::access::{AccessControl, AllowAll, PeerId, StaticAcl};
use haven_node::api::{create_router, AppState, VaultRegistry};
use haven_node::config::Config;
use haven_storage::{LocalFs, VaultFs};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Haven - decentralized encrypted secrets synchronization node
#[derive(Parser, Debug)]
#[command(name = "haven-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "haven.yaml")]
    config: PathBuf,

    /// HTTP listen address (overrides the config file)
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Vault data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("haven={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "starting haven node"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let fs: Arc<dyn VaultFs> = Arc::new(LocalFs::new(&config.data_dir));
    let acl: Arc<dyn AccessControl> = if config.allowed_peers.is_empty() {
        Arc::new(AllowAll)
    } else {
        let mut acl = StaticAcl::new();
        for (vault, peers) in &config.allowed_peers {
            for peer in peers {
                acl.allow(vault, PeerId(peer.clone()));
            }
        }
        Arc::new(acl)
    };

    let state = AppState {
        vaults: Arc::new(VaultRegistry::new(fs)),
        acl,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("node is ready");
    axum::serve(listener, app).await?;
    Ok(())
}
