//! Bounded key-to-entry store with strict LRU eviction and single-flight
//! population.
//!
//! [`EntryCache::add`] publishes a pending slot and its shared future under
//! one lock, so a concurrent [`EntryCache::get`] for an unresolved key
//! always observes the same in-flight population instead of starting a new
//! one. Waiters only resolve once the writer signals completion; partial or
//! failed populations are evicted and never served.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{AssetError, Result};

/// A fully populated cache entry: response header snapshot plus the body
/// chunks in write order. Single writer during population, shared readers
/// afterwards.
#[derive(Debug)]
pub struct CacheEntry {
    /// Cache key, the resolved request path.
    pub key: String,
    /// Header snapshot taken at population time.
    pub headers: Vec<(String, String)>,
    /// Body chunks in the order they were written.
    pub chunks: Vec<Bytes>,
    /// Population completion time, used for `Age` on replay.
    pub created_at: SystemTime,
}

impl CacheEntry {
    /// Total body length in bytes.
    pub fn len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// True when the entry has an empty body.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Looks up a stored header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Ready(Arc<CacheEntry>),
    Failed(String),
}

#[derive(Debug)]
struct Slot {
    rx: watch::Receiver<SlotState>,
    /// Distinguishes this slot from a successor published under the same
    /// key after an eviction.
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    /// LRU order; front is the least recently used key.
    order: VecDeque<String>,
    next_generation: u64,
}

/// Callback fired with the key (and the completed entry, when there is one)
/// immediately before an entry is dropped, whether by eviction,
/// invalidation, or population failure.
///
/// The hook runs under the cache lock; it must not call back into the
/// cache.
pub type RemovalHook = Box<dyn Fn(&str, Option<&Arc<CacheEntry>>) + Send + Sync>;

struct CacheInner {
    max_objects: usize,
    state: Mutex<CacheState>,
    removal_hook: RwLock<Option<RemovalHook>>,
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.state.lock().slots.len();
        f.debug_struct("CacheInner")
            .field("max_objects", &self.max_objects)
            .field("len", &len)
            .finish()
    }
}

/// Bounded LRU cache of served entries, keyed by resolved request path.
#[derive(Debug, Clone)]
pub struct EntryCache {
    inner: Arc<CacheInner>,
}

impl EntryCache {
    pub fn new(max_objects: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                max_objects: max_objects.max(1),
                state: Mutex::new(CacheState::default()),
                removal_hook: RwLock::new(None),
            }),
        }
    }

    /// Registers the pre-removal callback. Replaces any prior hook.
    pub fn set_removal_hook(&self, hook: RemovalHook) {
        *self.inner.removal_hook.write() = Some(hook);
    }

    /// Begins a population for `key` and returns the writer handle.
    ///
    /// Callers must have checked [`get`](Self::get) first; the absence
    /// check is the caller's contract. The key is appended as most
    /// recently used, and inserting beyond `max_objects` synchronously
    /// evicts the least recently used key.
    pub fn add(&self, key: &str) -> PopulationHandle {
        let mut state = self.inner.state.lock();
        if state.slots.contains_key(key) {
            // Caller broke the absence-check contract; the old slot is
            // dropped so there is still only one live population per key.
            self.inner.remove_locked(&mut state, key);
        }
        self.begin_locked(&mut state, key)
    }

    /// Atomic get-or-begin: returns the shared future when `key` already
    /// has an in-flight or completed population, otherwise begins one.
    /// This is the combinator concurrent callers use so a second request
    /// for an unresolved key observes the same in-flight future instead
    /// of starting a duplicate population.
    pub fn try_add(&self, key: &str) -> AddOutcome {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.slots.get(key) {
            let rx = slot.rx.clone();
            promote(&mut state.order, key);
            return AddOutcome::Existing(EntryFuture { rx });
        }
        AddOutcome::Begun(self.begin_locked(&mut state, key))
    }

    /// Publishes a pending slot and returns its writer. Must run under
    /// the state lock so slot publication is atomic with respect to
    /// concurrent `get`/`add`.
    fn begin_locked(&self, state: &mut CacheState, key: &str) -> PopulationHandle {
        let (tx, rx) = watch::channel(SlotState::Pending);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.slots.insert(key.to_owned(), Slot { rx, generation });
        state.order.push_back(key.to_owned());

        while state.order.len() > self.inner.max_objects {
            let Some(lru) = state.order.front().cloned() else {
                break;
            };
            debug!(key = %lru, "evicting least recently used entry");
            self.inner.remove_locked(state, &lru);
        }

        PopulationHandle {
            key: key.to_owned(),
            generation,
            inner: Arc::clone(&self.inner),
            tx,
            chunks: Vec::new(),
            finished: false,
        }
    }

    /// Shared future for `key`, pending or resolved. Never triggers a
    /// population. Access promotes the key to most recently used.
    pub fn get(&self, key: &str) -> Option<EntryFuture> {
        let mut state = self.inner.state.lock();
        let rx = state.slots.get(key)?.rx.clone();
        promote(&mut state.order, key);
        Some(EntryFuture { rx })
    }

    /// Drops `key`, firing the removal hook first. Returns whether the key
    /// was present. This is the invalidation entry point for the
    /// watcher-driven task.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.remove_locked(&mut state, key)
    }

    /// Drops every entry, firing the removal hook for each. Used when the
    /// invalidation stream lags and per-key eviction can no longer be
    /// trusted.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let keys: Vec<String> = state.slots.keys().cloned().collect();
        for key in keys {
            self.inner.remove_locked(&mut state, &key);
        }
    }

    /// Number of live entries (pending populations included).
    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    /// Fires the removal hook and drops the slot. The hook sees the entry
    /// while it is still stored.
    fn remove_locked(&self, state: &mut CacheState, key: &str) -> bool {
        if !state.slots.contains_key(key) {
            return false;
        }

        {
            let hook = self.removal_hook.read();
            if let Some(hook) = hook.as_ref() {
                let entry = state.slots.get(key).and_then(|slot| {
                    match &*slot.rx.borrow() {
                        SlotState::Ready(entry) => Some(Arc::clone(entry)),
                        _ => None,
                    }
                });
                hook(key, entry.as_ref());
            }
        }

        state.slots.remove(key);
        if let Some(pos) = state.order.iter().position(|k| k == key) {
            state.order.remove(pos);
        }
        true
    }

    /// Removal guarded by generation, so a writer whose slot was already
    /// evicted and replaced never tears down its successor.
    fn remove_if_current(&self, key: &str, generation: u64) {
        let mut state = self.state.lock();
        let current = state
            .slots
            .get(key)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false);
        if current {
            self.remove_locked(&mut state, key);
        }
    }
}

fn promote(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        if let Some(k) = order.remove(pos) {
            order.push_back(k);
        }
    }
}

/// Result of [`EntryCache::try_add`].
#[derive(Debug)]
pub enum AddOutcome {
    /// The caller owns the population and must complete or fail it.
    Begun(PopulationHandle),
    /// Another caller is already populating (or has populated) the key.
    Existing(EntryFuture),
}

/// Shared handle on an in-flight or completed population.
#[derive(Debug)]
pub struct EntryFuture {
    rx: watch::Receiver<SlotState>,
}

impl EntryFuture {
    /// Waits for the population to finish. Resolves with the full entry
    /// after the writer signals completion; rejects if the population
    /// failed or its writer was dropped. Readers never observe a partial
    /// entry.
    pub async fn entry(mut self) -> Result<Arc<CacheEntry>> {
        loop {
            {
                let state = self.rx.borrow();
                match &*state {
                    SlotState::Ready(entry) => return Ok(Arc::clone(entry)),
                    SlotState::Failed(reason) => {
                        return Err(AssetError::PopulationFailed(reason.clone()));
                    }
                    SlotState::Pending => {}
                }
            }
            if self.rx.changed().await.is_err() {
                return Err(AssetError::PopulationFailed(
                    "population abandoned".to_owned(),
                ));
            }
        }
    }

    /// The completed entry, if the population already resolved.
    pub fn ready(&self) -> Option<Arc<CacheEntry>> {
        match &*self.rx.borrow() {
            SlotState::Ready(entry) => Some(Arc::clone(entry)),
            _ => None,
        }
    }
}

/// Single writer for one population. Exactly one exists per in-flight key.
///
/// Dropping the handle without completing counts as a failure: waiters are
/// rejected and the key is evicted.
#[derive(Debug)]
pub struct PopulationHandle {
    key: String,
    generation: u64,
    inner: Arc<CacheInner>,
    tx: watch::Sender<SlotState>,
    chunks: Vec<Bytes>,
    finished: bool,
}

impl PopulationHandle {
    /// Appends one body chunk. Chunks are replayed to readers in the order
    /// they were written.
    pub fn push(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// Seals the entry and resolves every waiter with it.
    pub fn complete(mut self, headers: Vec<(String, String)>) -> Arc<CacheEntry> {
        self.finished = true;
        let entry = Arc::new(CacheEntry {
            key: std::mem::take(&mut self.key),
            headers,
            chunks: std::mem::take(&mut self.chunks),
            created_at: SystemTime::now(),
        });
        let _ = self.tx.send(SlotState::Ready(Arc::clone(&entry)));
        entry
    }

    /// Rejects every waiter and evicts the key; nothing partial is kept.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.finished = true;
        let reason = reason.into();
        let _ = self.tx.send(SlotState::Failed(reason.clone()));
        self.inner.remove_if_current(&self.key, self.generation);
        debug!(key = %self.key, %reason, "population failed, entry evicted");
    }
}

impl Drop for PopulationHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let _ = self
            .tx
            .send(SlotState::Failed("population abandoned".to_owned()));
        self.inner.remove_if_current(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn resolves_written_bytes_in_order() {
        let cache = EntryCache::new(4);
        let mut handle = cache.add("/a");
        handle.push(Bytes::from_static(b"hello "));
        handle.push(Bytes::from_static(b"world"));
        handle.complete(vec![("content-type".into(), "text/plain".into())]);

        let entry = cache.get("/a").unwrap().entry().await.unwrap();
        assert_eq!(entry.chunks.len(), 2);
        assert_eq!(entry.len(), 11);
        let body: Vec<u8> = entry.chunks.iter().flatten().copied().collect();
        assert_eq!(body, b"hello world");
        assert_eq!(entry.header("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn concurrent_get_shares_the_inflight_population() {
        let cache = EntryCache::new(4);
        let mut handle = cache.add("/a");

        // Both waiters attach while the population is still pending.
        let fut1 = cache.get("/a").unwrap();
        let fut2 = cache.get("/a").unwrap();
        assert!(fut1.ready().is_none());

        let waiter1 = tokio::spawn(fut1.entry());
        let waiter2 = tokio::spawn(fut2.entry());

        handle.push(Bytes::from_static(b"shared"));
        handle.complete(Vec::new());

        let a = waiter1.await.unwrap().unwrap();
        let b = waiter2.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 6);
    }

    #[tokio::test]
    async fn inserting_beyond_capacity_evicts_the_lru_key() {
        let cache = EntryCache::new(2);
        let removed = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&removed);
        cache.set_removal_hook(Box::new(move |key, _| {
            seen.lock().push(key.to_owned());
        }));

        cache.add("/a").complete(Vec::new());
        cache.add("/b").complete(Vec::new());
        cache.add("/c").complete(Vec::new());

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/b").is_some());
        assert!(cache.get("/c").is_some());
        assert_eq!(&*removed.lock(), &["/a".to_owned()]);
    }

    #[tokio::test]
    async fn access_promotes_the_key() {
        let cache = EntryCache::new(2);
        cache.add("/a").complete(Vec::new());
        cache.add("/b").complete(Vec::new());

        // Touch /a so /b becomes the eviction candidate.
        let _ = cache.get("/a");
        cache.add("/c").complete(Vec::new());

        assert!(cache.get("/a").is_some());
        assert!(cache.get("/b").is_none());
    }

    #[tokio::test]
    async fn removal_hook_sees_the_entry_before_deletion() {
        let cache = EntryCache::new(4);
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        cache.set_removal_hook(Box::new(move |key, entry| {
            assert_eq!(key, "/a");
            let entry = entry.expect("completed entry visible in hook");
            assert_eq!(entry.len(), 3);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut handle = cache.add("/a");
        handle.push(Bytes::from_static(b"abc"));
        handle.complete(Vec::new());

        assert!(cache.remove("/a"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(cache.get("/a").is_none());
        // A second remove is a no-op and must not re-fire the hook.
        assert!(!cache.remove("/a"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_population_rejects_waiters_and_evicts() {
        let cache = EntryCache::new(4);
        let mut handle = cache.add("/a");
        handle.push(Bytes::from_static(b"partial"));

        let waiter = tokio::spawn(cache.get("/a").unwrap().entry());
        handle.fail("disk went away");

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AssetError::PopulationFailed(_)));
        assert!(cache.get("/a").is_none());
    }

    #[tokio::test]
    async fn try_add_grants_exactly_one_population() {
        let cache = EntryCache::new(4);

        let first = cache.try_add("/a");
        let second = cache.try_add("/a");

        let AddOutcome::Begun(mut handle) = first else {
            panic!("first caller owns the population");
        };
        let AddOutcome::Existing(waiter) = second else {
            panic!("second caller shares the in-flight future");
        };

        handle.push(Bytes::from_static(b"once"));
        handle.complete(Vec::new());

        let entry = waiter.entry().await.unwrap();
        assert_eq!(entry.len(), 4);
    }

    #[tokio::test]
    async fn clear_drops_everything_and_fires_hooks() {
        let cache = EntryCache::new(4);
        let removed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&removed);
        cache.set_removal_hook(Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        cache.add("/a").complete(Vec::new());
        cache.add("/b").complete(Vec::new());
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_failure() {
        let cache = EntryCache::new(4);
        let handle = cache.add("/a");
        let waiter = tokio::spawn(cache.get("/a").unwrap().entry());
        drop(handle);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AssetError::PopulationFailed(_)));
        assert!(cache.get("/a").is_none());
    }
}
