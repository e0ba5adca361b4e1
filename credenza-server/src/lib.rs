//! # Credenza Server
//!
//! Directory-backed HTTP asset server with live cache invalidation.
//!
//! ## Overview
//!
//! The server keeps an in-memory, bounded cache of served content
//! synchronized with a live filesystem tree:
//!
//! - **Conditional requests**: dependency-aware etags and
//!   `Last-Modified` validation, so unchanged resources answer 304
//!   without touching the disk.
//! - **Range requests**: single-range partial content straight from the
//!   file, bypassing the whole-object cache.
//! - **Live invalidation**: a recursive watcher retags changed resources
//!   (and everything that depends on them) and evicts their cache
//!   entries, with no restart and no per-request polling.
//! - **Transforms and virtuals**: pluggable content converters and
//!   on-demand producers, cached and invalidated like plain files.

use axum::Router;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod invalidate;
pub mod serve;
pub mod state;

pub use config::{CacheConfig, Config};
pub use state::AppState;

/// Builds the router: every path falls through to the serve pipeline.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(serve::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assembles state from a config, starts observation of the root, and
/// wires the invalidation task. The caller serves the returned router.
pub async fn bootstrap(config: Config) -> anyhow::Result<(Router, AppState)> {
    let state = AppState::new(config)?;
    state
        .watcher
        .observe(&state.config.root, &state.config.ignore)
        .await?;

    if let Some(cache) = &state.cache {
        invalidate::spawn(&state.watcher, cache.clone());
    }

    Ok((build_router(state.clone()), state))
}
