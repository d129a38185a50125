// src/main.rs

//! The main entry point for the `maxiofs-clusterd` control-plane daemon.

use anyhow::Result;
use maxiofs_cluster::core::orchestrator::ClusterOrchestrator;
use maxiofs_cluster::core::store::Store;
use maxiofs_cluster::server;
use maxiofs_cluster::ClusterRuntimeConfig;
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("maxiofs-clusterd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("clusterd.toml");

    let config = match ClusterRuntimeConfig::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    let init_node_name = args
        .iter()
        .position(|arg| arg == "--init")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let join_args = args
        .iter()
        .position(|arg| arg == "--join")
        .map(|i| (args.get(i + 1), args.get(i + 2)));

    if let Err(e) = run_app(config, init_node_name, join_args).await {
        error!(error = %e, "clusterd exited with an error");
        return Err(e);
    }
    Ok(())
}

async fn run_app(
    config: ClusterRuntimeConfig,
    init_node_name: Option<&str>,
    join_args: Option<(Option<&String>, Option<&String>)>,
) -> Result<()> {
    let store = Store::connect(&config.database_url()).await?;
    let mut orchestrator = ClusterOrchestrator::load(store).await?;

    if let Some(node_name) = init_node_name {
        let token = orchestrator
            .initialize(node_name, &config.public_endpoint, &config.region)
            .await?;
        info!(cluster_token = %token, "cluster initialized, share this token with nodes that will join");
    } else if let Some((Some(cluster_token), Some(existing_node_url))) = join_args {
        let node_name = config.node_name.clone().unwrap_or_else(|| config.public_endpoint.clone());
        orchestrator
            .join(cluster_token, existing_node_url, &node_name, &config.public_endpoint)
            .await?;
        info!(%existing_node_url, "joined existing cluster");
    }

    let handle = orchestrator.handle();
    let (stop_tx, stop_rx) = watch::channel(false);

    let orchestrator_task = tokio::spawn(orchestrator.run(stop_rx.clone()));

    let listen_addr = config.listen_addr.clone();
    let require_mtls = config.tls.require_mtls;
    let server_task = tokio::spawn(async move {
        // No `LocalBucketLister` is wired up here: the standalone daemon
        // serves membership, sync, and reconciliation traffic, while
        // bucket listing is answered by whatever data-plane process embeds
        // this crate directly as a library (spec.md §1).
        server::run(&listen_addr, handle, None, require_mtls, stop_rx).await
    });

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = stop_tx.send(true);

    let _ = orchestrator_task.await;
    if let Err(e) = server_task.await? {
        error!(error = %e, "internal API server exited with an error");
    }

    Ok(())
}
