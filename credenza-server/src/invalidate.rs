//! Watcher-driven cache invalidation.
//!
//! A single task subscribes to the watcher's change stream and drops the
//! matching cache key on every change or removal. Dependent resources are
//! covered by the watcher's own fan-out: a change to a source path also
//! arrives here as events for each dependent, virtuals included.

use credenza_core::{AssetEventKind, AssetWatcher, EntryCache};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawns the invalidation task. It exits when the watcher is dropped.
pub fn spawn(watcher: &AssetWatcher, cache: EntryCache) -> JoinHandle<()> {
    let mut events = watcher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    AssetEventKind::Changed | AssetEventKind::Removed => {
                        // Both body variants of the path go together.
                        for key in [
                            crate::serve::cache_key(&event.path, false),
                            crate::serve::cache_key(&event.path, true),
                        ] {
                            if cache.remove(&key) {
                                debug!(%key, kind = ?event.kind, "evicted stale entry");
                            }
                        }
                    }
                    AssetEventKind::Added => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    // Missed events mean unknown staleness; drop everything
                    // rather than serve stale bytes.
                    warn!(skipped, "invalidation stream lagged, clearing cache");
                    cache.clear();
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
