//! Tessera relay server.
//!
//! ```text
//! tessera-relay --bind 0.0.0.0:9090 --data-dir /var/lib/tessera
//! ```
//!
//! Clients connect to `ws://<bind>/<document id>`. Every option can also be
//! set through a `TESSERA_*` environment variable; `RUST_LOG` controls logging.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;
use tessera_collab::{CompactionConfig, ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "tessera-relay")]
#[command(about = "Relay and persistence server for collaborative diagrams")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TESSERA_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for persisted documents
    #[arg(long, env = "TESSERA_DATA_DIR", default_value = "tessera_data")]
    data_dir: PathBuf,

    /// Keep documents in memory only; nothing survives a restart
    #[arg(long, env = "TESSERA_IN_MEMORY", conflicts_with = "data_dir")]
    in_memory: bool,

    /// fsync every update before acknowledging it
    #[arg(long, env = "TESSERA_SYNC_WRITES")]
    sync_writes: bool,

    #[arg(long, env = "TESSERA_MAX_PEERS_PER_ROOM", default_value_t = 100)]
    max_peers_per_room: usize,

    /// Frames buffered per peer before a slow peer starts losing them
    #[arg(long, env = "TESSERA_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    #[arg(long, env = "TESSERA_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Seconds between background compaction passes
    #[arg(long, env = "TESSERA_COMPACTION_INTERVAL_SECS", default_value_t = 60)]
    compaction_interval_secs: u64,

    /// Pending updates before a document is compacted
    #[arg(long, env = "TESSERA_COMPACTION_THRESHOLD", default_value_t = 100)]
    compaction_threshold: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_peers_per_room: self.max_peers_per_room,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            storage_path: (!self.in_memory).then(|| self.data_dir.clone()),
            sync_writes: self.sync_writes,
            compaction: CompactionConfig {
                interval: Duration::from_secs(self.compaction_interval_secs.max(1)),
                delta_threshold: self.compaction_threshold,
            },
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.server_config();
    info!("Starting Tessera relay on {}", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("Running in memory"),
    }

    let server = SyncServer::new(config)?;
    server.run_until(shutdown_signal()).await?;
    Ok(())
}
