//! Connection manager
//!
//! Owns the set of live client agents and sequences their synchronization
//! through the [`StageGate`]:
//!
//! 1. a new connection is handshaken, then receives the whole server tree
//!    (`InitialSync`) before it joins the live set;
//! 2. each client transaction is admitted under `ClientSync` and its diff is
//!    kept as pending once it commits;
//! 3. a `GlobalSync` then forwards pending changes to every live client
//!    except the one that made them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stage::{Stage, StageGate};
use crate::config::SyncConfig;
use crate::diff::Diff;
use crate::protocol::{AdmissionCheck, Agent, Role};
use crate::tree;

pub struct ConnectionManager {
    root: PathBuf,
    config: SyncConfig,
    agents: DashMap<Uuid, Arc<Agent>>,
    pending: Mutex<Vec<(Uuid, Diff)>>,
    stages: StageGate,
}

impl ConnectionManager {
    pub fn new(root: impl Into<PathBuf>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            config,
            agents: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            stages: StageGate::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of clients that finished their initial sync and are still
    /// connected.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.agents.contains_key(&id)
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not disable nagle");
            }
            info!(%peer, "client connected");

            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.add_connection(stream).await {
                    warn!(%peer, error = %format!("{e:#}"), "client not admitted");
                }
            });
        }
    }

    /// Runs a new connection through handshake and initial sync, then adds
    /// it to the live set.
    pub async fn add_connection<S>(self: &Arc<Self>, stream: S) -> Result<Arc<Agent>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let agent = Agent::spawn(
            stream,
            self.root.clone(),
            self.config.agent_options(Role::Server),
            Some(self.admission_check()),
        );
        agent
            .wait_handshake()
            .await
            .context("handshake failed")?;

        let synced = self
            .stages
            .run(Stage::InitialSync, self.initial_sync(&agent))
            .await;
        if let Err(e) = synced {
            agent.close().await;
            return Err(e);
        }

        // Dropped from the live set as soon as the connection ends.
        let manager = Arc::downgrade(self);
        let watched = agent.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.agents.remove(&watched.id());
            }
            info!(agent = %watched.id(), "client disconnected");
        });

        Ok(agent)
    }

    async fn initial_sync(&self, agent: &Arc<Agent>) -> Result<()> {
        let root = self.root.clone();
        let snapshot = tokio::task::spawn_blocking(move || tree::snapshot(&root))
            .await?
            .context("could not scan the sync root")?;

        info!(agent = %agent.id(), changes = snapshot.len(), "initial sync");
        if !snapshot.is_empty() {
            snapshot
                .patch_agent(agent)
                .await
                .context("initial sync failed")?;
        }

        self.agents.insert(agent.id(), agent.clone());
        Ok(())
    }

    fn admission_check(self: &Arc<Self>) -> AdmissionCheck {
        let manager: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |agent: Arc<Agent>| {
            let manager = manager.clone();
            async move {
                let manager = manager.upgrade().context("server is shutting down")?;
                manager.admit(agent).await
            }
            .boxed()
        })
    }

    /// Holds a `ClientSync` slot for the client's transaction. Resolves once
    /// the slot is granted; the slot itself is released when the
    /// transaction commits or the connection ends.
    async fn admit(self: Arc<Self>, agent: Arc<Agent>) -> Result<()> {
        let commits = agent.subscribe_commits();
        let (admitted_tx, admitted_rx) = oneshot::channel();

        tokio::spawn(async move {
            let synced = self
                .stages
                .run(
                    Stage::ClientSync,
                    self.collect_transaction(&agent, commits, admitted_tx),
                )
                .await;

            if synced.is_ok() {
                if let Err(e) = self.global_sync().await {
                    warn!(error = %format!("{e:#}"), "broadcast failed");
                }
            }
        });

        admitted_rx.await.context("client transaction was not admitted")
    }

    async fn collect_transaction(
        &self,
        agent: &Agent,
        mut commits: broadcast::Receiver<Diff>,
        admitted: oneshot::Sender<()>,
    ) -> Result<()> {
        let id = agent.id();
        info!(agent = %id, "client transaction admitted");
        let _ = admitted.send(());

        let committed = tokio::select! {
            diff = next_commit(&mut commits) => diff,
            _ = agent.closed() => None,
        };

        match committed {
            Some(diff) if diff.is_empty() => debug!(agent = %id, "empty transaction"),
            Some(diff) => {
                info!(agent = %id, changes = diff.len(), "client transaction pending broadcast");
                self.pending.lock().push((id, diff));
            }
            None => warn!(agent = %id, "client left mid-transaction"),
        }
        Ok(())
    }

    /// Sends every pending change to each live client that did not make it.
    pub async fn global_sync(&self) -> Result<()> {
        self.stages
            .run(Stage::GlobalSync, async {
                let pending = std::mem::take(&mut *self.pending.lock());
                if pending.is_empty() {
                    return Ok(());
                }

                let targets: Vec<Arc<Agent>> =
                    self.agents.iter().map(|entry| entry.value().clone()).collect();
                let patches: Vec<_> = targets
                    .into_iter()
                    .filter_map(|agent| {
                        let merged = merge_excluding(&pending, agent.id());
                        (!merged.is_empty()).then_some((agent, merged))
                    })
                    .collect();

                info!(
                    contributions = pending.len(),
                    targets = patches.len(),
                    "broadcasting changes"
                );

                let results = join_all(patches.into_iter().map(|(agent, diff)| async move {
                    let outcome = diff.patch_agent(&agent).await;
                    (agent.id(), outcome)
                }))
                .await;

                for (id, outcome) in results {
                    if let Err(e) = outcome {
                        warn!(agent = %id, error = %e, "could not patch client");
                    }
                }
                Ok(())
            })
            .await
    }
}

/// Merge of every pending diff not contributed by `exclude`, in arrival
/// order.
fn merge_excluding(pending: &[(Uuid, Diff)], exclude: Uuid) -> Diff {
    let mut merged = Diff::new();
    for (origin, diff) in pending {
        if *origin != exclude {
            merged.merge_with(diff);
        }
    }
    merged
}

async fn next_commit(commits: &mut broadcast::Receiver<Diff>) -> Option<Diff> {
    loop {
        match commits.recv().await {
            Ok(diff) => return Some(diff),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "commit notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
