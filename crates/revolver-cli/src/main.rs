// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Revolver Contributors

//! Revolver - rebuild a local service on file changes and swap it in behind
//! a draining TCP proxy without dropping connections.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revolver_ecdysis::{
    ChangeHandler, CommandSet, Debouncer, GracefulShutdown, ProxyError, RestartCoordinator,
    Retrigger, ReverseProxy, Trigger, DEFAULT_READ_HEADER_TIMEOUT,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod config;
mod telemetry;
mod watcher;

use config::Config;
use watcher::{ChangeLogger, ExtensionFilter, FileWatcher};

/// Revolver - zero-downtime restarts for local development
#[derive(Parser)]
#[command(name = "revolver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Path of the file to create
        file: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Watch the project and keep the service running behind the proxies
    Watch {
        /// Configuration file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { file, force } => init(&file, force),
        Commands::Watch { file } => watch(&file).await,
    }
}

fn init(file: &Path, force: bool) -> Result<()> {
    Config::write_default(file, force)
        .with_context(|| format!("Failed to initialize {}", file.display()))?;
    println!("Wrote {}", file.display());
    Ok(())
}

async fn watch(file: &Path) -> Result<()> {
    let config = Config::load(file)?;
    telemetry::init(config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        config = %file.display(),
        root = %config.root.display(),
        exec = %config.exec.display(),
        ports = config.ports.len(),
        "Starting revolver"
    );

    let shutdown = GracefulShutdown::new(config.shutdown_grace());
    let root = shutdown.token();
    // Installed before any child exists so an early Ctrl-C still drains.
    let mut signals = shutdown
        .listen()
        .context("Failed to install signal handlers")?;

    // Every listen socket must be ours before the first backend starts.
    let mut proxies = Vec::with_capacity(config.ports.len());
    let mut listeners = Vec::with_capacity(config.ports.len());
    for port in &config.ports {
        let mut proxy = ReverseProxy::new(config.listen_addr(port.port))
            .with_drain_interval(config.drain_interval());
        if config.trust_proxy_header {
            proxy = proxy.with_inbound_proxy_header(DEFAULT_READ_HEADER_TIMEOUT);
        }
        let listener = proxy
            .bind()
            .await
            .with_context(|| format!("Failed to bind proxy for port '{}'", port.name))?;
        listeners.push(listener);
        proxies.push((port.name.clone(), proxy));
    }

    let mut proxy_tasks: JoinSet<(String, Result<(), ProxyError>)> = JoinSet::new();
    for ((name, proxy), listener) in proxies.iter().zip(listeners) {
        let name = name.clone();
        let proxy = proxy.clone();
        let token = root.child_token();
        proxy_tasks.spawn(async move {
            let result = proxy.serve(listener, token).await;
            (name, result)
        });
    }

    let coordinator = RestartCoordinator::new(
        config.coordinator_settings(),
        proxies,
        Arc::new(CommandSet::new(config.stop_grace())),
        root.clone(),
    );

    let debouncer = Debouncer::spawn(
        config.debounce(),
        Arc::new(coordinator.clone()),
        root.child_token(),
    );
    let handlers: Vec<Arc<dyn ChangeHandler>> = vec![
        Arc::new(debouncer) as Arc<dyn ChangeHandler>,
        Arc::new(ChangeLogger),
    ];
    let filter = ExtensionFilter::new(config.exts.clone());
    let file_watcher = FileWatcher::start(&config.root, filter, handlers)
        .with_context(|| format!("Failed to watch {}", config.root.display()))?;

    // Runs in the background; failures are logged and the next change retries.
    coordinator.retrigger(Trigger::Initial);

    let proxy_failure = tokio::select! {
        signal = signals.recv() => {
            info!(?signal, "Shutdown requested");
            None
        }
        Some(joined) = proxy_tasks.join_next() => match joined {
            Ok((name, Err(e))) => {
                Some(anyhow::Error::new(e).context(format!("Proxy '{}' failed", name)))
            }
            Ok((name, Ok(()))) => Some(anyhow::anyhow!("Proxy '{}' stopped unexpectedly", name)),
            Err(e) => Some(anyhow::Error::new(e).context("Proxy task panicked")),
        },
    };

    drop(file_watcher);
    if let Some(e) = &proxy_failure {
        error!(error = %e, "Shutting down after proxy failure");
    }

    if !shutdown.drain(coordinator.wait_stopped()).await {
        warn!("Some services did not stop within the grace period");
    }
    while proxy_tasks.join_next().await.is_some() {}

    info!("Revolver stopped");
    match proxy_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
