//! Pending filesystem changes
//!
//! A [`Diff`] accumulates add/unlink operations for files and directories
//! while keeping the hierarchy consistent after every single mutation:
//!
//! - adding a path cancels any pending deletion of that path or its ancestors
//! - unlinking is a no-op when an ancestor directory is already being unlinked
//! - unlinking a directory drops every pending operation below it
//!
//! Paths are root-relative and `/`-separated (see [`crate::tree::normalize`]).

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::Agent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub files_to_add: BTreeSet<String>,
    pub dirs_to_add: BTreeSet<String>,
    pub files_to_unlink: BTreeSet<String>,
    pub dirs_to_unlink: BTreeSet<String>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files_to_add.is_empty()
            && self.dirs_to_add.is_empty()
            && self.files_to_unlink.is_empty()
            && self.dirs_to_unlink.is_empty()
    }

    /// Total number of pending operations.
    pub fn len(&self) -> usize {
        self.files_to_add.len()
            + self.dirs_to_add.len()
            + self.files_to_unlink.len()
            + self.dirs_to_unlink.len()
    }

    pub fn add_file(&mut self, path: &str) {
        self.keep_path(path);
        self.files_to_unlink.remove(path);
        self.files_to_add.insert(path.to_string());
    }

    pub fn add_dir(&mut self, path: &str) {
        self.keep_path(path);
        self.dirs_to_add.insert(path.to_string());
    }

    pub fn add_unlink(&mut self, path: &str) {
        if self.ancestor_unlinked(path) {
            return;
        }
        self.files_to_add.remove(path);
        self.files_to_unlink.insert(path.to_string());
    }

    pub fn add_unlink_dir(&mut self, path: &str) {
        if self.ancestor_unlinked(path) {
            return;
        }
        for set in [
            &mut self.files_to_add,
            &mut self.dirs_to_add,
            &mut self.files_to_unlink,
            &mut self.dirs_to_unlink,
        ] {
            set.retain(|p| !is_descendant(p, path));
        }
        self.dirs_to_add.remove(path);
        self.dirs_to_unlink.insert(path.to_string());
    }

    /// Forgets every pending operation on `path` and below it, as if none
    /// of them had been recorded.
    pub fn discard(&mut self, path: &str) {
        for set in [
            &mut self.files_to_add,
            &mut self.dirs_to_add,
            &mut self.files_to_unlink,
            &mut self.dirs_to_unlink,
        ] {
            set.retain(|p| p != path && !is_descendant(p, path));
        }
    }

    /// Replays every operation of `other` through the invariant-preserving
    /// mutators, so the result is the same as having recorded `other`'s
    /// operations directly on `self`.
    pub fn merge_with(&mut self, other: &Diff) {
        for file in &other.files_to_add {
            self.add_file(file);
        }
        for file in &other.files_to_unlink {
            self.add_unlink(file);
        }
        for dir in &other.dirs_to_add {
            self.add_dir(dir);
        }
        for dir in &other.dirs_to_unlink {
            self.add_unlink_dir(dir);
        }
    }

    /// Replays the diff onto `agent` as one transaction: directories and
    /// files are created before anything is removed.
    pub async fn apply_changes(&self, agent: &Agent) -> ProtocolResult<()> {
        agent.start_transaction().await?;

        let result = self.send_all(agent).await;
        if let Err(err) = &result {
            warn!(agent = %agent.id(), error = %err, "aborting patch");
            agent.close().await;
            return result;
        }

        agent.end_transaction().await
    }

    /// [`Diff::apply_changes`], rejected as soon as the agent's connection
    /// ends instead of waiting on acknowledgements that will never come.
    pub async fn patch_agent(&self, agent: &Agent) -> ProtocolResult<()> {
        tokio::select! {
            result = self.apply_changes(agent) => result,
            _ = agent.closed() => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn send_all(&self, agent: &Agent) -> ProtocolResult<()> {
        for dir in &self.dirs_to_add {
            agent.send_dir(dir).await?;
        }

        for file in &self.files_to_add {
            match agent.send_file(file).await {
                Err(ProtocolError::LocalFileMissing(path)) => {
                    debug!(path = %path.display(), "file vanished before it could be sent");
                }
                other => other?,
            }
        }

        for file in &self.files_to_unlink {
            agent.send_unlink(file).await?;
        }

        for dir in &self.dirs_to_unlink {
            agent.send_unlink_dir(dir).await?;
        }

        Ok(())
    }

    /// Cancels pending deletion of `path` and all of its ancestors.
    fn keep_path(&mut self, path: &str) {
        self.dirs_to_unlink.remove(path);
        for ancestor in ancestors(path) {
            self.dirs_to_unlink.remove(ancestor);
        }
    }

    fn ancestor_unlinked(&self, path: &str) -> bool {
        ancestors(path).any(|ancestor| self.dirs_to_unlink.contains(ancestor))
    }
}

/// Strict ancestors of a relative path, nearest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .rev()
        .filter(|(_, c)| *c == '/')
        .map(move |(i, _)| &path[..i])
        .filter(|p| !p.is_empty())
}

fn is_descendant(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
