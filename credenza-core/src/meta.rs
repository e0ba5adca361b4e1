//! Per-path metadata and content-identity tags.
//!
//! A [`FileMeta`] is created the first time a path is observed (stat or
//! directory scan) and mutated only by the watcher. The etag of a path is a
//! pure function of its own stats plus the stats of the transitive closure
//! of its declared dependencies, so a change anywhere in that closure
//! produces a new tag.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata snapshot for a single observed path.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Absolute path of the observed node.
    pub path: PathBuf,
    /// Size in bytes; 0 for virtual nodes.
    pub size: u64,
    /// Modification time; `UNIX_EPOCH` for virtual nodes.
    pub mtime: SystemTime,
    /// Whether the node is a directory.
    pub is_dir: bool,
    /// Content-identity tag, quoted per HTTP convention.
    pub etag: String,
    /// Declared dependency paths; changes to any of them retag this node.
    pub dependencies: BTreeSet<PathBuf>,
    /// Content type served for this node.
    pub content_type: String,
}

impl FileMeta {
    /// Builds metadata from a filesystem stat result. The etag is left
    /// empty; the watcher computes it once the node is in the table.
    pub fn from_fs(path: &Path, meta: &std::fs::Metadata) -> Self {
        Self {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            is_dir: meta.is_dir(),
            etag: String::new(),
            dependencies: BTreeSet::new(),
            content_type: content_type_for(path),
        }
    }

    /// Builds a synthetic node with no backing file. Its identity is
    /// carried entirely by its dependencies.
    pub fn virtual_node(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            size: 0,
            mtime: UNIX_EPOCH,
            is_dir: false,
            etag: String::new(),
            dependencies: BTreeSet::new(),
            content_type: content_type_for(path),
        }
    }

    /// Modification time as whole milliseconds since the epoch.
    pub fn mtime_ms(&self) -> u64 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Whether stats differ from a fresh stat result, the added/modified
    /// classification used by the watcher.
    pub fn differs_from(&self, meta: &std::fs::Metadata) -> bool {
        self.size != meta.len() || self.mtime != meta.modified().unwrap_or(UNIX_EPOCH)
    }
}

/// Computes the etag for `path`: `"<sum size>-<sum mtime_ms>"` over the
/// node itself and the transitive closure of its dependencies. The visited
/// set makes cyclic registrations terminate, each node contributing once.
pub fn compute_etag(table: &HashMap<PathBuf, FileMeta>, path: &Path) -> String {
    let mut size: u64 = 0;
    let mut mtime: u64 = 0;

    let mut visited: HashSet<&Path> = HashSet::new();
    let mut stack: Vec<&Path> = vec![path];
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(meta) = table.get(current) {
            size = size.wrapping_add(meta.size);
            mtime = mtime.wrapping_add(meta.mtime_ms());
            for dep in &meta.dependencies {
                stack.push(dep.as_path());
            }
        }
    }

    format!("\"{size}-{mtime}\"")
}

/// Content type for a path, with a charset annotation for textual types.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let essence = mime.essence_str();
    if mime.type_() == mime_guess::mime::TEXT
        || essence == "application/javascript"
        || essence == "application/json"
    {
        format!("{essence}; charset=UTF-8")
    } else {
        essence.to_owned()
    }
}
