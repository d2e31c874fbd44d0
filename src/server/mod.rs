pub mod manager;
pub mod stage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

pub use manager::ConnectionManager;
pub use stage::{Stage, StageGate};

use crate::config::ServerConfig;
use crate::tree;

/// Binds the listener and prepares the manager without accepting yet.
pub async fn bind(config: &ServerConfig) -> Result<(Arc<ConnectionManager>, TcpListener)> {
    let root = tree::ensure_root(&config.root)
        .await
        .with_context(|| format!("cannot use sync root {:?}", config.root))?;
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot listen on {}", config.bind))?;

    info!(root = %root.display(), addr = %listener.local_addr()?, "server ready");
    Ok((ConnectionManager::new(root, config.sync.clone()), listener))
}

pub async fn start(config: ServerConfig) -> Result<()> {
    let (manager, listener) = bind(&config).await?;
    manager.serve(listener).await
}
