//! Recursive filesystem observation with dependency-aware invalidation.
//!
//! The watcher owns the per-path metadata table and the dependency graph.
//! Raw `notify` events are funneled through an mpsc channel into a single
//! drain task, which re-stats changed paths, classifies them as
//! added/modified/deleted against the prior snapshot, recomputes
//! content-identity tags, and fans change events out to every dependent
//! node. Consumers subscribe through a broadcast channel; nothing calls
//! back into the watcher during event delivery.
//!
//! Watch registration failures are not fatal: the affected path stays in
//! the metadata table in always-revalidate mode.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{AssetError, Result};
use crate::meta::{FileMeta, compute_etag};

/// Capacity of the raw notify channel. Bursts beyond this block the notify
/// callback thread briefly rather than dropping events.
const RAW_EVENT_CAPACITY: usize = 1024;

/// Capacity of the subscriber broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// What happened to an observed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetEventKind {
    Added,
    Changed,
    Removed,
}

/// Change notification delivered to subscribers. `etag` carries the
/// freshly recomputed tag for added/changed nodes.
#[derive(Debug, Clone)]
pub struct AssetEvent {
    pub path: PathBuf,
    pub kind: AssetEventKind,
    pub etag: Option<String>,
}

enum RawMessage {
    Event(notify::Event),
    Error(String),
}

/// Filesystem watcher and metadata authority. Cheap to clone; all clones
/// share one metadata table and one native watcher.
#[derive(Debug, Clone)]
pub struct AssetWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    meta: RwLock<HashMap<PathBuf, FileMeta>>,
    ignore: parking_lot::RwLock<GlobSet>,
    fs: parking_lot::Mutex<RecommendedWatcher>,
    /// Paths with a live native watch registration.
    watched: parking_lot::Mutex<HashSet<PathBuf>>,
    events_tx: broadcast::Sender<AssetEvent>,
}

impl std::fmt::Debug for WatcherInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherInner")
            .field("watched", &self.watched.lock().len())
            .finish()
    }
}

impl AssetWatcher {
    /// Creates the watcher and spawns its event drain task. The task exits
    /// on its own once the last clone of this handle is dropped.
    pub fn new() -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<RawMessage>(RAW_EVENT_CAPACITY);

        let fs = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => RawMessage::Event(event),
                    Err(err) => RawMessage::Error(err.to_string()),
                };
                if raw_tx.blocking_send(msg).is_err() {
                    // Drain task is gone; the watcher is shutting down.
                }
            },
            notify::Config::default(),
        )
        .map_err(|err| AssetError::Internal(format!("failed to create watcher: {err}")))?;

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(WatcherInner {
            meta: RwLock::new(HashMap::new()),
            ignore: parking_lot::RwLock::new(GlobSet::empty()),
            fs: parking_lot::Mutex::new(fs),
            watched: parking_lot::Mutex::new(HashSet::new()),
            events_tx,
        });

        tokio::spawn(drain_events(Arc::downgrade(&inner), raw_rx));

        Ok(Self { inner })
    }

    /// Recursively registers watches for `root` and every descendant whose
    /// basename does not match an ignore glob. Resolves once every node
    /// has initial metadata and a computed etag.
    pub async fn observe(&self, root: &Path, ignore_globs: &[String]) -> Result<()> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_globs {
            let glob = Glob::new(pattern).map_err(|err| {
                AssetError::Internal(format!("invalid ignore glob {pattern:?}: {err}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| AssetError::Internal(format!("ignore globs: {err}")))?;
        *self.inner.ignore.write() = set;

        self.inner.register_tree(root).await?;

        // Initial tags for every observed node.
        let mut meta = self.inner.meta.write().await;
        let paths: Vec<PathBuf> = meta.keys().cloned().collect();
        for path in paths {
            let etag = compute_etag(&meta, &path);
            if let Some(entry) = meta.get_mut(&path) {
                entry.etag = etag;
            }
        }
        Ok(())
    }

    /// Metadata for `path`: the cached snapshot if present, otherwise the
    /// path is stat'ed (and scanned, for directories), watched, tagged,
    /// and cached first. Missing paths resolve to `Ok(None)`.
    pub async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>> {
        {
            let meta = self.inner.meta.read().await;
            if let Some(entry) = meta.get(path) {
                return Ok(Some(entry.clone()));
            }
        }

        let stat = match tokio::fs::metadata(path).await {
            Ok(stat) => stat,
            Err(err) => {
                let err = AssetError::from(err);
                if err.is_not_found() {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        if stat.is_dir() {
            self.inner.register_tree(path).await?;
        } else {
            self.inner
                .insert_node(path, FileMeta::from_fs(path, &stat))
                .await;
        }

        let mut meta = self.inner.meta.write().await;
        let etag = compute_etag(&meta, path);
        let entry = meta
            .get_mut(path)
            .ok_or_else(|| AssetError::Internal(format!("lost metadata for {}", path.display())))?;
        entry.etag = etag;
        Ok(Some(entry.clone()))
    }

    /// Replaces the dependency set of `path`. Every dependency must
    /// already have metadata; an unknown dependency is a programming
    /// error. The dependent's etag is recomputed against the new set.
    pub async fn set_dependencies(&self, path: &Path, deps: &[PathBuf]) -> Result<()> {
        let mut meta = self.inner.meta.write().await;
        for dep in deps {
            if !meta.contains_key(dep) {
                return Err(AssetError::InvalidDependency(dep.clone()));
            }
        }
        let Some(entry) = meta.get_mut(path) else {
            return Err(AssetError::InvalidDependency(path.to_path_buf()));
        };
        entry.dependencies = deps.iter().cloned().collect();

        let etag = compute_etag(&meta, path);
        if let Some(entry) = meta.get_mut(path) {
            entry.etag = etag;
        }
        Ok(())
    }

    /// Registers a synthetic node with no backing file, for dependency
    /// tracking only. Its identity is carried by its dependencies.
    pub async fn set_virtual(&self, path: &Path, deps: &[PathBuf]) -> Result<()> {
        {
            let mut meta = self.inner.meta.write().await;
            meta.entry(path.to_path_buf())
                .or_insert_with(|| FileMeta::virtual_node(path));
        }
        self.set_dependencies(path, deps).await
    }

    /// Overrides the guessed content type for `path`.
    pub async fn set_content_type(&self, path: &Path, content_type: &str) {
        let mut meta = self.inner.meta.write().await;
        if let Some(entry) = meta.get_mut(path) {
            entry.content_type = content_type.to_owned();
        }
    }

    /// Change notification stream. Each subscriber sees every event
    /// emitted after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.inner.events_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) async fn node_count(&self) -> usize {
        self.inner.meta.read().await.len()
    }
}

impl WatcherInner {
    fn is_ignored(&self, path: &Path) -> bool {
        match path.file_name() {
            Some(name) => self.ignore.read().is_match(Path::new(name)),
            None => false,
        }
    }

    /// Registers a native watch for `path`. Failure leaves the node in
    /// always-revalidate mode.
    fn watch_path(&self, path: &Path) {
        let mut watched = self.watched.lock();
        if watched.contains(path) {
            return;
        }
        let result = self.fs.lock().watch(path, RecursiveMode::NonRecursive);
        match result {
            Ok(()) => {
                watched.insert(path.to_path_buf());
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "watch setup failed, serving unwatched");
            }
        }
    }

    fn unwatch_path(&self, path: &Path) {
        if self.watched.lock().remove(path) {
            // The native registration may already be gone when the path
            // was deleted out from under us.
            let _ = self.fs.lock().unwatch(path);
        }
    }

    /// Stats and records `path` and, for directories, every non-ignored
    /// descendant. Returns the paths inserted for the first time.
    async fn register_tree(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut added = Vec::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(path) = stack.pop() {
            let stat = match tokio::fs::metadata(&path).await {
                Ok(stat) => stat,
                Err(err) => {
                    let err = AssetError::from(err);
                    if err.is_not_found() {
                        continue;
                    }
                    return Err(err);
                }
            };

            let is_dir = stat.is_dir();
            let inserted = self
                .insert_node(&path, FileMeta::from_fs(&path, &stat))
                .await;
            if inserted {
                added.push(path.clone());
            }

            if is_dir {
                let mut entries = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let child = entry.path();
                    if self.is_ignored(&child) {
                        continue;
                    }
                    stack.push(child);
                }
            }
        }

        Ok(added)
    }

    /// Inserts or refreshes a node and registers its watch. Returns true
    /// when the node was not previously known.
    async fn insert_node(&self, path: &Path, node: FileMeta) -> bool {
        let mut meta = self.meta.write().await;
        let inserted = meta.insert(path.to_path_buf(), node).is_none();
        drop(meta);
        self.watch_path(path);
        inserted
    }

    fn emit(&self, event: AssetEvent) {
        debug!(path = %event.path.display(), kind = ?event.kind, "asset event");
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Every node whose dependency closure contains any path in `seeds`.
    /// The seeds themselves are not included.
    async fn dependents_of(&self, seeds: &[PathBuf]) -> Vec<PathBuf> {
        let meta = self.meta.read().await;
        let mut affected: HashSet<PathBuf> = seeds.iter().cloned().collect();
        let mut dependents: Vec<PathBuf> = Vec::new();

        // Reverse edges until the frontier stops growing; the visited set
        // bounds cyclic graphs.
        loop {
            let mut grew = false;
            for (path, node) in meta.iter() {
                if affected.contains(path) {
                    continue;
                }
                if node.dependencies.iter().any(|dep| affected.contains(dep)) {
                    affected.insert(path.clone());
                    dependents.push(path.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        dependents
    }

    /// Re-tags `path` and emits a change event carrying the fresh tag.
    /// Directories keep their metadata current but do not emit.
    async fn retag_and_emit(&self, path: &Path, kind: AssetEventKind) {
        let mut meta = self.meta.write().await;
        let etag = compute_etag(&meta, path);
        let Some(entry) = meta.get_mut(path) else {
            return;
        };
        entry.etag = etag.clone();
        let is_dir = entry.is_dir;
        drop(meta);

        if !is_dir {
            self.emit(AssetEvent {
                path: path.to_path_buf(),
                kind,
                etag: Some(etag),
            });
        }
    }

    /// Removes `path` (and, for directories, its whole subtree) from the
    /// metadata table, tears down watches, and emits removal events.
    async fn remove_subtree(&self, path: &Path) -> Vec<PathBuf> {
        let mut meta = self.meta.write().await;
        let removed: Vec<PathBuf> = meta
            .keys()
            .filter(|p| *p == path || p.starts_with(path))
            .cloned()
            .collect();
        for p in &removed {
            meta.remove(p);
        }
        drop(meta);

        for p in &removed {
            self.unwatch_path(p);
            self.emit(AssetEvent {
                path: p.clone(),
                kind: AssetEventKind::Removed,
                etag: None,
            });
        }
        removed
    }

    /// Classifies one raw event path. Known directories get a full
    /// re-list; everything else goes through per-path classification.
    async fn process_path(&self, path: &Path) {
        if self.is_ignored(path) {
            return;
        }

        let known_dir = {
            let meta = self.meta.read().await;
            meta.get(path).map(|m| m.is_dir).unwrap_or(false)
        };

        if known_dir {
            self.rescan_dir(path).await;
        } else {
            self.classify_path(path).await;
        }
    }

    /// Added/modified/deleted classification for a single non-directory
    /// (or newly appeared) path, with dependent fan-out.
    async fn classify_path(&self, path: &Path) {
        let prior = {
            let meta = self.meta.read().await;
            meta.get(path).cloned()
        };

        match tokio::fs::metadata(path).await {
            Ok(stat) => match prior {
                Some(prior) if !prior.is_dir => {
                    if prior.differs_from(&stat) {
                        {
                            let mut meta = self.meta.write().await;
                            if let Some(entry) = meta.get_mut(path) {
                                entry.size = stat.len();
                                entry.mtime = stat.modified().unwrap_or(entry.mtime);
                            }
                        }
                        self.fan_out(path, AssetEventKind::Changed).await;
                    }
                }
                Some(_) => {
                    // A known directory's own events drive its re-scan.
                }
                None => {
                    // Newly appeared path; directories are scanned whole.
                    if let Ok(added) = self.register_tree(path).await {
                        for added_path in added {
                            self.retag_and_emit(&added_path, AssetEventKind::Added).await;
                        }
                    }
                }
            },
            Err(_) => {
                if prior.is_some() {
                    let removed = self.remove_subtree(path).await;
                    for gone in removed {
                        for dependent in self.dependents_of(&[gone]).await {
                            self.retag_and_emit(&dependent, AssetEventKind::Changed)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Emits a change event for `path` and one for each dependent, each
    /// with its freshly recomputed etag.
    async fn fan_out(&self, path: &Path, kind: AssetEventKind) {
        self.retag_and_emit(path, kind).await;
        for dependent in self.dependents_of(&[path.to_path_buf()]).await {
            self.retag_and_emit(&dependent, AssetEventKind::Changed).await;
        }
    }

    /// Full re-list of a directory, diffed against the prior per-entry
    /// snapshots. Each affected child is classified added, modified, or
    /// removed, and the resulting events unioned.
    async fn rescan_dir(&self, dir: &Path) {
        let mut listed: HashSet<PathBuf> = HashSet::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let child = entry.path();
                    if !self.is_ignored(&child) {
                        listed.insert(child);
                    }
                }
            }
            Err(_) => {
                // Directory itself went away; handled as a deletion.
                self.remove_subtree(dir).await;
                return;
            }
        }

        let prior_children: Vec<PathBuf> = {
            let meta = self.meta.read().await;
            meta.keys()
                .filter(|p| p.parent() == Some(dir))
                .cloned()
                .collect()
        };

        for child in &prior_children {
            if !listed.contains(child) {
                let removed = self.remove_subtree(child).await;
                for gone in removed {
                    for dependent in self.dependents_of(&[gone]).await {
                        self.retag_and_emit(&dependent, AssetEventKind::Changed)
                            .await;
                    }
                }
            }
        }

        for child in listed {
            self.classify_path(&child).await;
        }
    }
}

/// Drain loop for raw notify messages. Holds only a weak reference so the
/// watcher (and its native handles) tear down once the last
/// [`AssetWatcher`] clone is dropped.
async fn drain_events(inner: Weak<WatcherInner>, mut rx: mpsc::Receiver<RawMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match msg {
            RawMessage::Event(event) => {
                for path in &event.paths {
                    inner.process_path(path).await;
                }
            }
            RawMessage::Error(err) => {
                warn!(%err, "filesystem watch error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn wait_for(
        rx: &mut broadcast::Receiver<AssetEvent>,
        predicate: impl Fn(&AssetEvent) -> bool,
    ) -> AssetEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event before timeout")
    }

    #[tokio::test]
    async fn observe_records_metadata_and_etags() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), b"world!").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let meta = watcher
            .metadata(&tmp.path().join("a.txt"))
            .await
            .unwrap()
            .expect("a.txt observed");
        assert_eq!(meta.size, 5);
        assert!(meta.etag.starts_with("\"5-"));
        assert!(!meta.is_dir);

        let sub = watcher
            .metadata(&tmp.path().join("sub"))
            .await
            .unwrap()
            .expect("sub observed");
        assert!(sub.is_dir);
    }

    #[tokio::test]
    async fn observe_skips_ignored_basenames() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("skip.log"), b"x").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher
            .observe(tmp.path(), &["*.log".to_owned()])
            .await
            .unwrap();

        // root + keep.txt
        assert_eq!(watcher.node_count().await, 2);
    }

    #[tokio::test]
    async fn metadata_on_missing_path_is_none() {
        let tmp = tempdir().unwrap();
        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let meta = watcher.metadata(&tmp.path().join("nope.txt")).await.unwrap();
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn modification_emits_changed_with_fresh_etag() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"one").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();
        let before = watcher.metadata(&file).await.unwrap().unwrap().etag;

        let mut rx = watcher.subscribe();
        std::fs::write(&file, b"twotwo").unwrap();

        let event = wait_for(&mut rx, |e| {
            e.path == file && e.kind == AssetEventKind::Changed
        })
        .await;
        let etag = event.etag.expect("changed event carries etag");
        assert_ne!(etag, before);
        assert!(etag.starts_with("\"6-"));
    }

    #[tokio::test]
    async fn created_file_emits_added() {
        let tmp = tempdir().unwrap();
        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let mut rx = watcher.subscribe();
        let file = tmp.path().join("fresh.txt");
        std::fs::write(&file, b"123").unwrap();

        let event = wait_for(&mut rx, |e| e.path == file).await;
        assert_eq!(event.kind, AssetEventKind::Added);
    }

    #[tokio::test]
    async fn deleted_file_emits_removed() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"bye").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let mut rx = watcher.subscribe();
        std::fs::remove_file(&file).unwrap();

        let event = wait_for(&mut rx, |e| e.path == file).await;
        assert_eq!(event.kind, AssetEventKind::Removed);
        assert!(watcher.metadata(&file).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn modifying_a_dependency_retags_the_dependent() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("source.txt");
        let derived = tmp.path().join("derived.css");
        std::fs::write(&source, b"s1").unwrap();
        std::fs::write(&derived, b"d1").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();
        watcher
            .set_dependencies(&derived, &[source.clone()])
            .await
            .unwrap();
        let before = watcher.metadata(&derived).await.unwrap().unwrap().etag;

        let mut rx = watcher.subscribe();
        std::fs::write(&source, b"s2-grown").unwrap();

        let source_event = wait_for(&mut rx, |e| {
            e.path == source && e.kind == AssetEventKind::Changed
        })
        .await;
        assert!(source_event.etag.is_some());

        let derived_event = wait_for(&mut rx, |e| {
            e.path == derived && e.kind == AssetEventKind::Changed
        })
        .await;
        let after = derived_event.etag.expect("dependent carries fresh etag");
        assert_ne!(after, before);
    }

    #[tokio::test]
    async fn set_dependencies_rejects_unknown_paths() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let err = watcher
            .set_dependencies(&file, &[tmp.path().join("ghost.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::InvalidDependency(_)));
    }

    #[tokio::test]
    async fn virtual_nodes_track_their_dependencies() {
        let tmp = tempdir().unwrap();
        let dep = tmp.path().join("data.txt");
        std::fs::write(&dep, b"payload").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let virt = PathBuf::from("/virtual/manifest");
        watcher.set_virtual(&virt, &[dep.clone()]).await.unwrap();

        let meta = watcher.metadata(&virt).await.unwrap().unwrap();
        // Identity is carried entirely by the dependency's stats.
        assert_eq!(meta.etag, format!("\"7-{}\"", {
            let dep_meta = watcher.metadata(&dep).await.unwrap().unwrap();
            dep_meta.mtime_ms()
        }));

        let mut rx = watcher.subscribe();
        std::fs::write(&dep, b"payload-grown").unwrap();
        let event = wait_for(&mut rx, |e| {
            e.path == virt && e.kind == AssetEventKind::Changed
        })
        .await;
        assert_ne!(event.etag.unwrap(), meta.etag);
    }

    #[tokio::test]
    async fn metadata_registers_paths_outside_the_observed_root() {
        let tmp = tempdir().unwrap();
        let side = tempdir().unwrap();
        let file = side.path().join("late.txt");
        std::fs::write(&file, b"late").unwrap();

        let watcher = AssetWatcher::new().unwrap();
        watcher.observe(tmp.path(), &[]).await.unwrap();

        let meta = watcher.metadata(&file).await.unwrap().unwrap();
        assert_eq!(meta.size, 4);

        // The lazy registration is live: a later change fires an event.
        let mut rx = watcher.subscribe();
        std::fs::write(&file, b"late-and-longer").unwrap();
        let event = wait_for(&mut rx, |e| e.path == file).await;
        assert_eq!(event.kind, AssetEventKind::Changed);
    }
}
