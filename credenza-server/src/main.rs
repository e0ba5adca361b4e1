//! CLI entry point: config loading, tracing setup, and the serve loop.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use credenza_server::{Config, bootstrap};

#[derive(Parser, Debug)]
#[command(name = "credenza-server")]
#[command(about = "Directory-backed HTTP asset server with live cache invalidation")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "CREDENZA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory tree to serve. Overrides the config file.
    #[arg(long, env = "CREDENZA_ROOT")]
    root: Option<PathBuf>,

    /// Listen address. Overrides the config file.
    #[arg(long, env = "CREDENZA_BIND")]
    bind: Option<SocketAddr>,

    /// Serve dotfiles.
    #[arg(long)]
    hidden: bool,

    /// Disable the in-memory cache.
    #[arg(long)]
    no_cache: bool,

    /// Basename globs excluded from observation. Repeatable.
    #[arg(long = "ignore")]
    ignore: Vec<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.hidden {
            config.hidden = true;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
        config.ignore.extend(self.ignore);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    let bind = config.bind;
    let root = config.root.clone();

    let (router, _state) = bootstrap(config).await?;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, root = %root.display(), "serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}
