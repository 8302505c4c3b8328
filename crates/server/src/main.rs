//! Suffix cache update server.
//!
//! Creates the host-wide shared arena and serves `UpdateCache` RPCs from
//! inference workers. Exactly one instance runs per host; decoders attach
//! to the arena read-only and never talk to this server.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use specache_core::{SharedArena, UpdateService};
use specache_server::config::ServerConfig;
use specache_server::proto::suffix_cache_service_server::SuffixCacheServiceServer;
use specache_server::service::CacheServer;
use specache_server::{logging, shutdown};

#[derive(Parser)]
#[command(name = "specache-server", about = "Shared-memory suffix cache update server")]
struct Cli {
    /// Address to listen on, e.g. "[::]:6378".
    #[arg(long)]
    listen: Option<String>,

    /// Name of the shared-memory region.
    #[arg(long)]
    arena_name: Option<String>,

    /// Size of the shared-memory mapping, in GiB.
    #[arg(long)]
    arena_size_gib: Option<usize>,

    /// Number of prompt families the registry can hold.
    #[arg(long)]
    registry_capacity: Option<usize>,

    /// Base log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(name) = self.arena_name {
            config.arena_name = name;
        }
        if let Some(gib) = self.arena_size_gib {
            config.arena_size = gib * 1024 * 1024 * 1024;
        }
        if let Some(capacity) = self.registry_capacity {
            config.registry_capacity = capacity;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level);
    let config = cli.into_config();

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {:?}: {e}", config.listen_addr))?;

    let arena = Arc::new(SharedArena::create(&config.arena_config())?);
    let update = Arc::new(UpdateService::new(arena));
    let service = CacheServer::new(Arc::clone(&update));

    tracing::info!(%addr, arena = %config.arena_name, "suffix cache server listening");
    tonic::transport::Server::builder()
        .add_service(SuffixCacheServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown::shutdown_signal())
        .await?;

    // Destroy all published trees before the arena mapping goes away.
    update.drain();
    tracing::info!("shutdown complete");
    Ok(())
}
