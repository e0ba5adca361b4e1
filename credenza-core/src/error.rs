use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the watcher, cache, and transform layers.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch setup failed for {path}: {reason}")]
    WatchSetup { path: PathBuf, reason: String },

    #[error("dependency registered for a path without metadata: {0}")]
    InvalidDependency(PathBuf),

    #[error("cache population failed: {0}")]
    PopulationFailed(String),

    #[error("transform failed: {0}")]
    TransformFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AssetError {
    /// True when the underlying IO error means the path simply does not
    /// exist (ENOENT, ENOTDIR, name too long). These are delegated onward
    /// by callers rather than surfaced as failures.
    pub fn is_not_found(&self) -> bool {
        match self {
            AssetError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::NotADirectory
                    | std::io::ErrorKind::InvalidFilename
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;
