//! Transactional change queue
//!
//! Local changes are gathered into a [`Diff`] until the tree has been quiet
//! for `idle_gap`, and each gathered diff is replicated as one transaction.
//! Paths the peer has just written are filtered out so replicated changes
//! do not bounce back.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::FsEvent;
use crate::diff::Diff;

/// Remembers paths written on behalf of the peer for a short window.
#[derive(Debug)]
pub struct EchoFilter {
    window: Duration,
    recent: HashMap<String, Instant>,
}

impl EchoFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
        }
    }

    pub fn note(&mut self, path: &str) {
        self.recent.insert(path.to_string(), Instant::now());
    }

    /// Whether a local event on `path` is most likely the peer's own write
    /// coming back. Paths below a noted directory count as well.
    pub fn is_echo(&mut self, path: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        self.recent.retain(|_, noted| now.duration_since(*noted) < window);

        self.recent.contains_key(path)
            || path
                .match_indices('/')
                .any(|(i, _)| self.recent.contains_key(&path[..i]))
    }
}

pub struct ChangeQueue {
    events: mpsc::UnboundedReceiver<FsEvent>,
    applied: Option<broadcast::Receiver<String>>,
    echoes: EchoFilter,
    idle_gap: Duration,
}

impl ChangeQueue {
    pub fn new(
        events: mpsc::UnboundedReceiver<FsEvent>,
        applied: broadcast::Receiver<String>,
        idle_gap: Duration,
        echo_window: Duration,
    ) -> Self {
        Self {
            events,
            applied: Some(applied),
            echoes: EchoFilter::new(echo_window),
            idle_gap,
        }
    }

    /// Waits for the next batch of local changes. `None` once the watcher
    /// has stopped and nothing is left to deliver.
    pub async fn next_batch(&mut self) -> Option<Diff> {
        let mut batch = Batch::default();

        loop {
            let event = if batch.diff.is_empty() {
                self.next_event().await
            } else {
                match timeout(self.idle_gap, self.next_event()).await {
                    Ok(event) => event,
                    Err(_) => return Some(batch.diff),
                }
            };

            let Some(event) = event else {
                return (!batch.diff.is_empty()).then_some(batch.diff);
            };

            if self.echoes.is_echo(event.path()) {
                debug!(path = event.path(), "ignoring replicated change");
                continue;
            }
            batch.record(event);
        }
    }

    async fn next_event(&mut self) -> Option<FsEvent> {
        loop {
            tokio::select! {
                biased;
                path = next_applied(&mut self.applied) => self.echoes.note(&path),
                event = self.events.recv() => return event,
            }
        }
    }
}

/// Changes gathered since the last delivery.
#[derive(Default)]
struct Batch {
    diff: Diff,
    /// Directories that first appeared during this batch.
    created: HashSet<String>,
    /// Paths removed during this batch.
    removed: HashSet<String>,
}

impl Batch {
    fn record(&mut self, event: FsEvent) {
        match event {
            FsEvent::Added(path) | FsEvent::Changed(path) => self.diff.add_file(&path),
            FsEvent::Removed(path) => {
                self.diff.add_unlink(&path);
                self.removed.insert(path);
            }
            FsEvent::DirAdded(path) => {
                if !self.was_removed(&path) {
                    self.created.insert(path.clone());
                }
                self.diff.add_dir(&path);
            }
            FsEvent::DirRemoved(path) if self.created.contains(&path) => {
                // The peer never saw it, so there is nothing to remove there.
                let prefix = format!("{path}/");
                self.created
                    .retain(|dir| dir != &path && !dir.starts_with(&prefix));
                self.diff.discard(&path);
            }
            FsEvent::DirRemoved(path) => {
                self.diff.add_unlink_dir(&path);
                self.removed.insert(path);
            }
        }
    }

    /// Whether `path` or one of its ancestors went away earlier in the batch.
    fn was_removed(&self, path: &str) -> bool {
        self.removed.contains(path)
            || path
                .match_indices('/')
                .any(|(i, _)| self.removed.contains(&path[..i]))
    }
}

async fn next_applied(applied: &mut Option<broadcast::Receiver<String>>) -> String {
    loop {
        let Some(receiver) = applied.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(path) => return path,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "replicated path notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => *applied = None,
        }
    }
}
