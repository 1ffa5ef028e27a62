//! podsync-server — standalone pod synchronization server.
//!
//! Usage:
//!   podsync-server [BIND_ADDR] [STORAGE_PATH]
//!
//! With no arguments the server binds `127.0.0.1:9100` and keeps pods in
//! memory only. `PODSYNC_ADDR` / `PODSYNC_STORAGE` work as environment
//! fallbacks; positional arguments win.

use log::info;
use podsync::server::{PodServer, ServerConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let bind_addr = args
        .next()
        .or_else(|| std::env::var("PODSYNC_ADDR").ok())
        .unwrap_or_else(|| ServerConfig::default().bind_addr);
    let storage_path = args
        .next()
        .or_else(|| std::env::var("PODSYNC_STORAGE").ok())
        .map(PathBuf::from);

    let config = ServerConfig {
        bind_addr,
        storage_path,
        ..ServerConfig::default()
    };

    info!("Starting pod sync server on {}", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Persisting pods to {}", path.display()),
        None => info!("Running in-memory, nothing will survive a restart"),
    }

    let server = PodServer::new(config);
    server.run().await.expect("Server error");
}
