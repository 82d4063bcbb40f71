//! # keel
//!
//! Entry point of the keel controller.
//!
//! ## Startup
//!
//! 1. **Config** - TOML file plus `KEEL_*` overrides
//! 2. **Store** - in-memory store seeded from the YAML manifest
//! 3. **Remote** - GitHub adapter, or the in-memory tracker with its
//!    inspection endpoint
//! 4. **Controller** - watch bridge, resync timer and workers
//!
//! ## Shutdown
//!
//! Ctrl+C stops the controller; workers abandon in-flight attempts and every
//! task is joined before the process exits.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod config;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keel_reconciler::{Controller, IssueReconciler};
use keel_remote::{GitHubProvider, IssueProvider, MockProvider, inspect};
use keel_store::{InMemoryStore, IssueStore, Manifest};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::config::{KeelConfig, RemoteMode};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Commands::Run {
            config,
            manifest,
            fake_remote,
        } => run(config.as_deref(), &manifest, fake_remote).await,
        Commands::Config { config } => {
            let config = KeelConfig::load(config.as_deref())?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: Option<&Path>, manifest_path: &Path, fake_remote: bool) -> Result<()> {
    let mut config = KeelConfig::load(config_path)?;
    if fake_remote {
        config.remote.mode = RemoteMode::Fake;
    }
    config.validate().context("Invalid configuration")?;

    let store = Arc::new(load_store(manifest_path).await?);

    match config.remote.mode {
        RemoteMode::Github => {
            let provider = GitHubProvider::with_config(config.github_config())
                .context("Failed to build GitHub client")?;
            info!(api_url = %config.remote.api_url, "using GitHub tracker");
            run_controller(&config, store, Arc::new(provider)).await
        }
        RemoteMode::Fake => {
            let provider = MockProvider::new_arc();
            let server = serve_inspection(config.inspect.listen, Arc::clone(&provider)).await?;
            let result = run_controller(&config, store, provider).await;
            server.abort();
            result
        }
    }
}

async fn load_store(path: &Path) -> Result<InMemoryStore> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest = Manifest::from_yaml(&raw)
        .with_context(|| format!("Invalid manifest {}", path.display()))?;
    let (secrets, issues) = (manifest.secrets.len(), manifest.issues.len());

    let store = InMemoryStore::from_manifest(manifest)
        .await
        .context("Failed to load manifest into the store")?;
    info!(secrets, issues, manifest = %path.display(), "manifest loaded");
    Ok(store)
}

async fn run_controller<P>(config: &KeelConfig, store: Arc<InMemoryStore>, provider: Arc<P>) -> Result<()>
where
    P: IssueProvider + 'static,
{
    let reconciler = Arc::new(IssueReconciler::new(
        Arc::clone(&store),
        provider,
        config.reconciler_config(),
    ));

    Controller::new(reconciler, Arc::clone(&store), config.controller_config())
        .with_queue(config.work_queue())
        .run_until(wait_for_shutdown())
        .await
        .context("Controller failed to start")?;

    let remaining = store.list(None).await?.len();
    info!(remaining, "keel stopped");
    Ok(())
}

/// Serve the fake tracker's inspection endpoint in the background.
async fn serve_inspection(addr: SocketAddr, provider: Arc<MockProvider>) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind inspection endpoint on {addr}"))?;
    info!(addr = %listener.local_addr()?, "inspection endpoint listening");

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, inspect::router(provider)).await {
            error!(error = %err, "inspection endpoint failed");
        }
    }))
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
