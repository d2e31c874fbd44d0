//! Local change source
//!
//! A recursive, debounced `notify` watcher on the sync root whose raw events
//! are classified into root-relative [`FsEvent`]s. The [`queue`] module turns
//! those into transactions.

pub mod queue;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

pub use queue::{ChangeQueue, EchoFilter};

use crate::tree;

/// One classified change below the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Added(String),
    Changed(String),
    Removed(String),
    DirAdded(String),
    DirRemoved(String),
}

impl FsEvent {
    pub fn path(&self) -> &str {
        match self {
            FsEvent::Added(p)
            | FsEvent::Changed(p)
            | FsEvent::Removed(p)
            | FsEvent::DirAdded(p)
            | FsEvent::DirRemoved(p) => p,
        }
    }
}

/// Keeps the underlying watcher alive; dropping it stops the event stream.
pub struct FsWatcher {
    root: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FsWatcher {
    pub fn start(
        root: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FsEvent>)> {
        let root = root.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut classifier = EventClassifier::new(&root);

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for debounced in events {
                        for change in classifier.classify(&debounced.event) {
                            trace!(?change, "local change");
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!(%error, "watch error");
                    }
                }
            }
        })
        .context("failed to create file watcher")?;

        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
        debug!(root = %root.display(), "watching for changes");

        Ok((
            Self {
                root,
                _debouncer: debouncer,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Maps raw notify events to [`FsEvent`]s. Directories seen so far are
/// remembered, since a removed path can no longer be inspected.
pub(crate) struct EventClassifier {
    root: PathBuf,
    known_dirs: HashSet<String>,
}

impl EventClassifier {
    pub(crate) fn new(root: &Path) -> Self {
        let mut classifier = Self {
            root: root.to_path_buf(),
            known_dirs: HashSet::new(),
        };
        classifier.scan(root, &mut Vec::new());
        classifier
    }

    pub(crate) fn classify(&mut self, event: &Event) -> Vec<FsEvent> {
        let mut changes = Vec::new();

        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.appeared(path, &mut changes);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                self.disappeared(&event.paths[0], None, &mut changes);
                self.appeared(&event.paths[1], &mut changes);
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.symlink_metadata().is_ok() {
                        self.appeared(path, &mut changes);
                    } else {
                        self.disappeared(path, None, &mut changes);
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    let is_file = path.symlink_metadata().map(|m| m.is_file()).unwrap_or(false);
                    if let (true, Some(rel)) = (is_file, self.relative(path)) {
                        changes.push(FsEvent::Changed(rel));
                    }
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    if path.symlink_metadata().is_ok() {
                        // Recreated before the debouncer flushed.
                        self.appeared(path, &mut changes);
                    } else {
                        self.disappeared(path, Some(kind), &mut changes);
                    }
                }
            }
            _ => {}
        }

        changes
    }

    fn appeared(&mut self, path: &Path, changes: &mut Vec<FsEvent>) {
        let Some(rel) = self.relative(path) else {
            return;
        };
        let Ok(meta) = path.symlink_metadata() else {
            return;
        };

        if meta.is_dir() {
            if self.known_dirs.insert(rel.clone()) {
                changes.push(FsEvent::DirAdded(rel));
                // Contents moved or copied in along with the directory
                // produce no events of their own.
                self.scan(path, changes);
            }
        } else if meta.is_file() {
            changes.push(FsEvent::Added(rel));
        }
    }

    fn disappeared(&mut self, path: &Path, kind: Option<RemoveKind>, changes: &mut Vec<FsEvent>) {
        let Some(rel) = self.relative(path) else {
            return;
        };

        let was_dir = match kind {
            Some(RemoveKind::Folder) => true,
            Some(RemoveKind::File) => false,
            _ => self.known_dirs.contains(&rel),
        };

        if was_dir {
            let prefix = format!("{rel}/");
            self.known_dirs
                .retain(|dir| dir != &rel && !dir.starts_with(&prefix));
            changes.push(FsEvent::DirRemoved(rel));
        } else {
            changes.push(FsEvent::Removed(rel));
        }
    }

    fn scan(&mut self, dir: &Path, changes: &mut Vec<FsEvent>) {
        for entry in WalkDir::new(dir).min_depth(1).into_iter().flatten() {
            let file_type = entry.file_type();
            let Some(rel) = self.relative(entry.path()) else {
                continue;
            };
            if file_type.is_dir() {
                self.known_dirs.insert(rel.clone());
                changes.push(FsEvent::DirAdded(rel));
            } else if file_type.is_file() {
                changes.push(FsEvent::Added(rel));
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        tree::relative(&self.root, path).ok()
    }
}
