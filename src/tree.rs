//! Directory tree helpers
//!
//! Everything on the wire is a root-relative, `/`-separated path. These
//! helpers convert between that form and local filesystem paths, and list a
//! whole tree as a [`Diff`] for initial replication.

use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::diff::Diff;
use crate::error::PathError;

/// Normalizes a relative path coming from either side of a connection.
///
/// Both `/` and `\` separate segments so peers with different path
/// conventions interoperate. Empty and `.` segments are dropped, `..` is
/// rejected.
pub fn normalize(raw: &str) -> Result<String, PathError> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(raw.to_string())),
            s if s.ends_with(':') && segments.is_empty() => {
                // Drive prefix such as `C:`
                return Err(PathError::Traversal(raw.to_string()));
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }

    Ok(segments.join("/"))
}

/// Resolves a wire path under `root`, returning the local path together with
/// the normalized relative form.
pub fn resolve(root: &Path, raw: &str) -> Result<(PathBuf, String), PathError> {
    let relative = normalize(raw)?;
    let mut local = root.to_path_buf();
    local.extend(relative.split('/'));
    Ok((local, relative))
}

/// Relative form of a local path below `root`.
pub fn relative(root: &Path, local: &Path) -> Result<String, PathError> {
    let stripped = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;

    let mut segments = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(seg) => segments.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return Err(PathError::OutsideRoot(local.to_path_buf())),
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }

    Ok(segments.join("/"))
}

/// Lists every directory and regular file below `root` as additions.
/// Symlinks are not followed and not replicated.
pub fn snapshot(root: &Path) -> io::Result<Diff> {
    let mut diff = Diff::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let Ok(rel) = relative(root, entry.path()) else {
            continue;
        };

        if file_type.is_dir() {
            diff.add_dir(&rel);
        } else if file_type.is_file() {
            diff.add_file(&rel);
        }
    }

    Ok(diff)
}

/// Creates the sync root if it does not exist yet.
pub async fn ensure_root(root: &Path) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    tokio::fs::canonicalize(root).await
}
