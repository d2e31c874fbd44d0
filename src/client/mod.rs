//! Client runtime: dial the server, push the local tree, then replicate
//! local changes until the connection ends.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::with_retry;
use crate::protocol::{Agent, Role};
use crate::tree;
use crate::watcher::{ChangeQueue, FsWatcher};

/// Dials the server and completes the handshake.
pub async fn connect(config: &ClientConfig) -> Result<Arc<Agent>> {
    let root = tree::ensure_root(&config.root)
        .await
        .with_context(|| format!("cannot use sync root {:?}", config.root))?;
    let remote = config.remote();

    let stream = with_retry(&config.retry, || TcpStream::connect(remote.clone()))
        .await
        .with_context(|| format!("cannot reach server at {remote}"))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "could not disable nagle");
    }

    let agent = Agent::spawn(stream, root, config.sync.agent_options(Role::Client), None);
    agent
        .start_negotiation()
        .await
        .context("handshake with server failed")?;
    info!(agent = %agent.id(), %remote, "connected");
    Ok(agent)
}

/// Runs the client until the connection ends, which is always an error.
pub async fn run(config: ClientConfig) -> Result<()> {
    let agent = connect(&config).await?;

    // Subscribe before anything is replicated so no echo slips through.
    let applied = agent.subscribe_applied();
    let (watcher, events) = FsWatcher::start(agent.root(), config.sync.debounce())?;
    let mut queue = ChangeQueue::new(
        events,
        applied,
        config.sync.idle_gap(),
        config.sync.echo_window(),
    );

    let root = agent.root().to_path_buf();
    let snapshot = tokio::task::spawn_blocking(move || tree::snapshot(&root))
        .await?
        .context("could not scan the sync root")?;
    if !snapshot.is_empty() {
        info!(changes = snapshot.len(), "pushing local tree");
        snapshot
            .apply_changes(&agent)
            .await
            .context("initial push failed")?;
    }

    loop {
        let batch = tokio::select! {
            batch = queue.next_batch() => batch,
            _ = agent.closed() => bail!("connection to server closed"),
        };

        let Some(batch) = batch else {
            bail!("file watcher on {} stopped", watcher.root().display());
        };

        info!(changes = batch.len(), "replicating local changes");
        batch
            .apply_changes(&agent)
            .await
            .context("replicating local changes failed")?;
    }
}
