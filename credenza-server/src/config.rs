//! Server configuration.
//!
//! Loaded from an optional TOML file, then overlaid with CLI flags. Every
//! knob has a serde default so partial files work.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Whole-object cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch for the in-memory cache.
    pub enabled: bool,
    /// Maximum number of cached objects; strict LRU beyond this.
    pub max_objects: usize,
    /// Objects at or above this many bytes bypass the cache entirely.
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_objects: 256,
            max_size: 256 * 1024,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory tree to serve. Required; validated at startup.
    pub root: PathBuf,
    /// Listen address.
    pub bind: SocketAddr,
    /// Browser cache max-age in milliseconds.
    pub max_age_ms: u64,
    /// Serve dotfiles.
    pub hidden: bool,
    /// Redirect directory paths to their trailing-slash form.
    pub redirect: bool,
    /// Resolve trailing-slash paths to `index.html`.
    pub index: bool,
    /// Basename globs excluded from observation.
    pub ignore: Vec<String>,
    /// Route prefix stripped from request paths before resolution.
    pub prefix: Option<String>,
    /// Serve gzip-encoded bodies to clients that accept them.
    pub gzip: bool,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_age_ms: 0,
            hidden: false,
            redirect: true,
            index: true,
            ignore: Vec::new(),
            prefix: None,
            gzip: true,
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Checks invariants that cannot be expressed in serde defaults.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.root.as_os_str().is_empty(),
            "a root directory is required"
        );
        anyhow::ensure!(
            self.root.is_dir(),
            "root {} is not a directory",
            self.root.display()
        );
        if let Some(prefix) = &self.prefix {
            anyhow::ensure!(
                prefix.starts_with('/'),
                "prefix must start with '/', got {prefix:?}"
            );
        }
        Ok(())
    }

    /// `Cache-Control` max-age in whole seconds.
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_ms / 1000
    }
}
