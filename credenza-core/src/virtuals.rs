//! Virtual resources: served paths with no backing file.
//!
//! A producer generates the payload on demand and declares the file paths
//! it was derived from; the server caches the payload and registers the
//! declared paths with the watcher, so a change to any of them invalidates
//! the cached payload exactly like a file change would.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Result;

/// Producer for one virtual resource, bound to a fixed root.
#[async_trait]
pub trait VirtualResource: Send + Sync {
    /// Generates the payload plus the file paths it depends on.
    async fn produce(&self, root: &Path) -> Result<(Bytes, Vec<PathBuf>)>;

    /// Content type served for the produced payload.
    fn content_type(&self) -> &str;
}

/// Registry mapping request paths to their producers.
#[derive(Clone, Default)]
pub struct VirtualSet {
    producers: Arc<DashMap<String, Arc<dyn VirtualResource>>>,
}

impl std::fmt::Debug for VirtualSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSet")
            .field("len", &self.producers.len())
            .finish()
    }
}

impl VirtualSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a producer under a request path (e.g. `/app.manifest`).
    /// Replaces any prior producer for the same path.
    pub fn register(&self, request_path: &str, producer: Arc<dyn VirtualResource>) {
        self.producers.insert(request_path.to_owned(), producer);
    }

    /// Looks up the producer for a request path.
    pub fn get(&self, request_path: &str) -> Option<Arc<dyn VirtualResource>> {
        self.producers
            .get(request_path)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
