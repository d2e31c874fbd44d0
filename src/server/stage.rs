//! Stage gate
//!
//! Synchronization work runs in stages. One stage is active at a time. Work
//! asking for the stage that is already running joins it, unless that stage
//! is [`Stage::GlobalSync`], which always runs alone. Everything else waits
//! its turn in arrival order, and a stage only ends once every member that
//! joined it has finished.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Replicating the server tree to a newly connected client.
    InitialSync,
    /// A client transaction being written into the server tree.
    ClientSync,
    /// Broadcasting pending changes to every live client.
    GlobalSync,
}

impl Stage {
    pub fn is_joinable(self) -> bool {
        !matches!(self, Stage::GlobalSync)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::InitialSync => "initial-sync",
            Stage::ClientSync => "client-sync",
            Stage::GlobalSync => "global-sync",
        };
        f.write_str(name)
    }
}

struct Batch {
    stage: Stage,
    members: usize,
    drained: Arc<Notify>,
}

#[derive(Default)]
pub struct StageGate {
    turn: AsyncMutex<()>,
    active: Mutex<Option<Batch>>,
}

/// Membership in the active batch, released on drop.
struct Ticket<'a> {
    gate: &'a StageGate,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock();
        let Some(batch) = active.as_mut() else {
            return;
        };

        batch.members -= 1;
        if batch.members == 0 {
            let drained = batch.drained.clone();
            *active = None;
            drained.notify_one();
        }
    }
}

impl StageGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stage currently running, if any.
    pub fn current(&self) -> Option<Stage> {
        self.active.lock().as_ref().map(|batch| batch.stage)
    }

    /// Runs `work` as part of `stage`.
    pub async fn run<F, T>(&self, stage: Stage, work: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if let Some(ticket) = self.join(stage) {
            debug!(%stage, "joined running stage");
            let result = work.await;
            drop(ticket);
            return log_failure(stage, result);
        }

        let _turn = self.turn.lock().await;
        let (ticket, drained) = self.open(stage);
        debug!(%stage, "stage started");

        let result = work.await;
        drop(ticket);
        // The last member out, possibly us, leaves a permit behind.
        drained.notified().await;
        debug!(%stage, "stage finished");

        log_failure(stage, result)
    }

    fn join(&self, stage: Stage) -> Option<Ticket<'_>> {
        if !stage.is_joinable() {
            return None;
        }

        let mut active = self.active.lock();
        match active.as_mut() {
            Some(batch) if batch.stage == stage => {
                batch.members += 1;
                Some(Ticket { gate: self })
            }
            _ => None,
        }
    }

    fn open(&self, stage: Stage) -> (Ticket<'_>, Arc<Notify>) {
        let drained = Arc::new(Notify::new());
        *self.active.lock() = Some(Batch {
            stage,
            members: 1,
            drained: drained.clone(),
        });
        (Ticket { gate: self }, drained)
    }
}

fn log_failure<T>(stage: Stage, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if let Err(err) = &result {
        warn!(%stage, error = %format!("{err:#}"), "stage work failed");
    }
    result
}
