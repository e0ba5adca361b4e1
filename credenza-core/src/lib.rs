//! # Credenza Core
//!
//! Core library for the Credenza asset server: an in-memory caching engine
//! kept synchronized with a live filesystem tree.
//!
//! ## Overview
//!
//! Three subsystems cooperate to serve a changing directory tree with
//! minimal filesystem I/O per request:
//!
//! - [`watcher`]: recursive filesystem observation, per-path metadata, and
//!   a dependency graph. Content-identity tags cover the transitive
//!   dependency closure, so derived resources are invalidated when any of
//!   their sources change.
//! - [`cache`]: a bounded LRU store with single-flight population, so
//!   concurrent requests for the same uncached resource share one read.
//! - [`transform`] and [`virtuals`]: the collaborator seams for content
//!   conversion (compile, minify, compress) and for resources produced on
//!   demand without a backing file.

pub mod cache;
pub mod error;
pub mod meta;
pub mod transform;
pub mod virtuals;
pub mod watcher;

pub use cache::{AddOutcome, CacheEntry, EntryCache, EntryFuture, PopulationHandle};
pub use error::{AssetError, Result};
pub use meta::{FileMeta, content_type_for};
pub use transform::{ContentTransform, GzipTransform, TransformOutput, TransformPipeline};
pub use virtuals::{VirtualResource, VirtualSet};
pub use watcher::{AssetEvent, AssetEventKind, AssetWatcher};
