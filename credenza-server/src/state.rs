//! Shared request-handling state.

use std::sync::Arc;

use credenza_core::{AssetWatcher, EntryCache, TransformPipeline, VirtualSet};

use crate::config::Config;

/// Per-server-instance state injected into every handler. Cloning is
/// cheap; all clones share the same watcher, cache, and registries.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub watcher: AssetWatcher,
    /// Absent when caching is disabled in the config.
    pub cache: Option<EntryCache>,
    pub transforms: TransformPipeline,
    pub virtuals: VirtualSet,
}

impl AppState {
    /// Assembles state from a validated config: builds the watcher and
    /// cache and wires the default transform set.
    pub fn new(config: Config) -> credenza_core::Result<Self> {
        let watcher = AssetWatcher::new()?;
        let cache = config
            .cache
            .enabled
            .then(|| EntryCache::new(config.cache.max_objects));

        let mut transforms = TransformPipeline::new();
        if config.gzip {
            transforms.push(Arc::new(credenza_core::GzipTransform));
        }

        Ok(Self {
            config: Arc::new(config),
            watcher,
            cache,
            transforms,
            virtuals: VirtualSet::new(),
        })
    }
}
